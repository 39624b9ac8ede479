//! Traits and types for implementing objects in the OD

use canode_common::{
    objects::{AccessType, DataType, ObjectCode, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use super::{ConstField, ObjectFlagAccess, SubObjectAccess};

/// A trait for accessing objects
///
/// Any struct which implements an object in the object dictionary must implement this trait
pub trait ObjectAccess: Sync + Send {
    /// Read raw bytes from a subobject
    ///
    /// All implementers are required to allow reading a subset of the object bytes, i.e. offset may
    /// be non-zero, and/or the buf length may be shorter than the object data. Returns the number
    /// of bytes read, which is 0 once `offset` reaches the end of the data.
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// Get the number of bytes available for a read
    fn read_size(&self, sub: u8) -> Result<usize, AbortCode>;

    /// Write raw bytes to a subobject
    ///
    /// The length of `data` must match the size of the object, or else it will fail with either
    /// [`AbortCode::DataTypeMismatchLengthLow`] or [`AbortCode::DataTypeMismatchLengthHigh`].
    ///
    /// If the sub is does not exist, it shall fail with [`AbortCode::NoSuchSubIndex`].
    ///
    /// If the sub exists but is not writeable, it shall fail with [`AbortCode::ReadOnly`].
    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode>;

    /// Write a previously persisted value back into a sub object
    ///
    /// This is used when loading stored values at startup. Objects whose writes depend on run-time
    /// state (e.g. PDO configuration, which may only be changed while the PDO is disabled) override
    /// this to accept the raw value, and validate it when it is activated.
    fn restore(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.write(sub, data)
    }

    /// Initialize a new partial write
    ///
    /// This must be called before performing calls to `partial_write`.
    ///
    /// A default implementation is provided which returns an appropriate error:
    /// - [`AbortCode::NoSuchSubIndex`] if the sub object does not exist
    /// - [`AbortCode::ReadOnly`] if the sub object is read-only
    /// - [`AbortCode::UnsupportedAccess`] if the sub object does not support partial writes
    ///
    /// Objects which support partial writing must override the default implementation.
    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        if let Ok(sub_info) = self.sub_info(sub) {
            if sub_info.access_type.is_writable() {
                Err(AbortCode::UnsupportedAccess)
            } else {
                Err(AbortCode::ReadOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    /// Perform a partial write of bytes to a subobject
    ///
    /// Partial writes MUST be done sequentially, and implementers may assume that this is the case.
    fn write_partial(&self, _sub: u8, _buf: &[u8]) -> Result<(), AbortCode> {
        // All callers should have failed at begin_partial
        Err(AbortCode::GeneralError)
    }

    /// Finalize a previous partial write
    ///
    /// This must always be called after using partial_write, after all partial_write calls have
    /// been completed.
    fn end_partial(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::GeneralError)
    }

    /// Get the type of this object
    fn object_code(&self) -> ObjectCode;

    /// Get metadata about a sub object
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode>;

    /// Get the highest sub index available in this object
    fn max_sub_number(&self) -> u8 {
        match self.object_code() {
            ObjectCode::Array | ObjectCode::Record => self.read_u8(0).unwrap_or(0),
            _ => 0,
        }
    }

    /// Install an extension on this object, replacing any previous one
    ///
    /// Only objects wrapped in an [`ExtendableObject`] support extensions. Passing `None` removes
    /// the current extension.
    fn set_extension(
        &self,
        _index: u16,
        _ext: Option<&'static dyn ObjectExtension>,
    ) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Set an event flag for the specified sub object on this object
    ///
    /// Event flags are used for triggering PDOs. This is optional, as not all objects support PDOs
    /// or PDO triggering.
    fn set_event_flag(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Read an event flag for the specified sub object
    ///
    /// This is optional as not all objects support events
    fn read_event_flag(&self, _sub: u8) -> bool {
        false
    }

    /// Clear event flags for all sub objects
    ///
    /// This is optional as not all objects support events
    fn clear_events(&self) {}

    /// Get the access type of a specific sub object
    fn access_type(&self, sub: u8) -> Result<AccessType, AbortCode> {
        Ok(self.sub_info(sub)?.access_type)
    }

    /// Get the data type of a specific sub object
    fn data_type(&self, sub: u8) -> Result<DataType, AbortCode> {
        Ok(self.sub_info(sub)?.data_type)
    }

    /// Get the maximum size of an sub object
    ///
    /// For most sub objects, this matches the current_size, but for strings the size of the
    /// currently stored value (returned by `current_size()`) may be smaller.
    fn size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    /// Read a sub object as a u64
    fn read_u64(&self, sub: u8) -> Result<u64, AbortCode> {
        let mut buf = [0; 8];
        self.read(sub, 0, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a sub object as a u32
    fn read_u32(&self, sub: u8) -> Result<u32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, 0, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a sub object as a u16
    fn read_u16(&self, sub: u8) -> Result<u16, AbortCode> {
        let mut buf = [0; 2];
        self.read(sub, 0, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a sub object as a u8
    fn read_u8(&self, sub: u8) -> Result<u8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, 0, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a sub object as an i32
    fn read_i32(&self, sub: u8) -> Result<i32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, 0, &mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a sub object as an i16
    fn read_i16(&self, sub: u8) -> Result<i16, AbortCode> {
        let mut buf = [0; 2];
        self.read(sub, 0, &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    /// Read a sub object as an i8
    fn read_i8(&self, sub: u8) -> Result<i8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, 0, &mut buf)?;
        Ok(buf[0] as i8)
    }
}

/// A trait for structs which represent Objects to implement
///
/// Implementing this type allows a type sub object which implements [`SubObjectAccess`] to
/// implement [`ObjectAccess`] simply by implementing this trait to provide a sub object for each
/// sub index.
pub trait ProvidesSubObjects {
    /// Get a sub object
    ///
    /// It should return None if the sub object does not exist, and when it does exist it returns a
    /// tuple containing a [`SubInfo`] with metadata about the sub object, and [`dyn
    /// SubObjectAccess`] which provides read/write access to the sub object data.
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)>;

    /// Get the object flags for this object
    ///
    /// If the object supports flags, it should override this method to return a reference to them
    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        None
    }

    /// What type of object is this
    fn object_code(&self) -> ObjectCode;
}

// Implement ObjectAccess for any type that implements ProvidesSubObjects
impl<T: ProvidesSubObjects + Sync + Send> ObjectAccess for T {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if let Some((info, access)) = self.get_sub_object(sub) {
            if info.access_type.is_readable() {
                access.read(offset, buf)
            } else {
                Err(AbortCode::WriteOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        if let Some((_info, access)) = self.get_sub_object(sub) {
            Ok(access.read_size())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if let Some((info, access)) = self.get_sub_object(sub) {
            if info.access_type.is_writable() {
                access.write(data)
            } else {
                Err(AbortCode::ReadOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        if let Some((info, access)) = self.get_sub_object(sub) {
            if info.access_type.is_writable() {
                access.begin_partial()
            } else {
                Err(AbortCode::ReadOnly)
            }
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn write_partial(&self, sub: u8, buf: &[u8]) -> Result<(), AbortCode> {
        if let Some((_, access)) = self.get_sub_object(sub) {
            access.write_partial(buf)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn end_partial(&self, sub: u8) -> Result<(), AbortCode> {
        if let Some((_, access)) = self.get_sub_object(sub) {
            access.end_partial()
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn set_event_flag(&self, sub: u8) -> Result<(), AbortCode> {
        if let Some(flags) = self.flags() {
            flags.set_flag(sub);
            Ok(())
        } else {
            Err(AbortCode::UnsupportedAccess)
        }
    }

    fn read_event_flag(&self, sub: u8) -> bool {
        if let Some(flags) = self.flags() {
            flags.get_flag(sub)
        } else {
            false
        }
    }

    fn clear_events(&self) {
        if let Some(flags) = self.flags() {
            flags.clear();
        }
    }

    fn object_code(&self) -> ObjectCode {
        ProvidesSubObjects::object_code(self)
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if let Some((info, _access)) = self.get_sub_object(sub) {
            Ok(info)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

/// An object with a single sub object at sub index 0
#[allow(missing_debug_implementations)]
pub struct VarObject<F> {
    field: F,
    info: SubInfo,
    flags: Option<&'static dyn ObjectFlagAccess>,
}

impl<F: SubObjectAccess> VarObject<F> {
    /// Create a VAR object
    pub const fn new(field: F, info: SubInfo) -> Self {
        Self {
            field,
            info,
            flags: None,
        }
    }

    /// Create a VAR object which supports TPDO event flags
    pub const fn new_with_flags(
        field: F,
        info: SubInfo,
        flags: &'static dyn ObjectFlagAccess,
    ) -> Self {
        Self {
            field,
            info,
            flags: Some(flags),
        }
    }

    /// Access the sub object
    pub fn field(&self) -> &F {
        &self.field
    }
}

impl<F: SubObjectAccess> ProvidesSubObjects for VarObject<F> {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        match sub {
            0 => Some((self.info, &self.field)),
            _ => None,
        }
    }

    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        self.flags
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

/// An object with N sub objects of the same type at sub indices 1..=N
#[allow(missing_debug_implementations)]
pub struct ArrayObject<F, const N: usize> {
    len: ConstField<1>,
    elements: [F; N],
    info: SubInfo,
    flags: Option<&'static dyn ObjectFlagAccess>,
}

impl<F: SubObjectAccess, const N: usize> ArrayObject<F, N> {
    /// Create an ARRAY object. `info` describes each of the elements.
    pub const fn new(elements: [F; N], info: SubInfo) -> Self {
        Self {
            len: ConstField::new([N as u8]),
            elements,
            info,
            flags: None,
        }
    }

    /// Create an ARRAY object which supports TPDO event flags
    pub const fn new_with_flags(
        elements: [F; N],
        info: SubInfo,
        flags: &'static dyn ObjectFlagAccess,
    ) -> Self {
        Self {
            len: ConstField::new([N as u8]),
            elements,
            info,
            flags: Some(flags),
        }
    }

    /// Access an element by sub index (1..=N)
    pub fn element(&self, sub: u8) -> Option<&F> {
        (sub as usize)
            .checked_sub(1)
            .and_then(|i| self.elements.get(i))
    }
}

impl<F: SubObjectAccess, const N: usize> ProvidesSubObjects for ArrayObject<F, N> {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        if sub == 0 {
            Some((SubInfo::MAX_SUB_NUMBER, &self.len))
        } else {
            self.element(sub)
                .map(|e| (self.info, e as &dyn SubObjectAccess))
        }
    }

    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        self.flags
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }
}

/// A run-time installable hook which intercepts accesses to an object
///
/// The default implementations delegate to the wrapped object, so an extension only needs to
/// override the accesses it cares about. `index` is the index of the entry the extension was
/// installed on, which lets a single extension serve several entries.
pub trait ObjectExtension: Sync + Send {
    /// Handle a read of `sub`
    fn read(
        &self,
        _index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        object.read(sub, offset, buf)
    }

    /// Get the size of the data returned by `read`
    fn read_size(
        &self,
        _index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
    ) -> Result<usize, AbortCode> {
        object.read_size(sub)
    }

    /// Handle a write of `sub`
    fn write(
        &self,
        _index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        data: &[u8],
    ) -> Result<(), AbortCode> {
        object.write(sub, data)
    }

    /// Start a write of `sub` which arrives in pieces, for values larger than the SDO buffer
    fn begin_partial(&self, _index: u16, object: &dyn ObjectAccess, sub: u8) -> Result<(), AbortCode> {
        object.begin_partial(sub)
    }

    /// Handle the next piece of a partial write
    fn write_partial(
        &self,
        _index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        buf: &[u8],
    ) -> Result<(), AbortCode> {
        object.write_partial(sub, buf)
    }

    /// Finish, or abandon, a partial write
    fn end_partial(&self, _index: u16, object: &dyn ObjectAccess, sub: u8) -> Result<(), AbortCode> {
        object.end_partial(sub)
    }
}

/// Wraps an object so that an [`ObjectExtension`] can be installed on it
#[allow(missing_debug_implementations)]
pub struct ExtendableObject<T> {
    inner: T,
    extension: AtomicCell<Option<(u16, &'static dyn ObjectExtension)>>,
}

impl<T: ObjectAccess> ExtendableObject<T> {
    /// Wrap an object, with no extension installed
    pub const fn new(inner: T) -> Self {
        Self {
            inner,
            extension: AtomicCell::new(None),
        }
    }

    /// Access the wrapped object, bypassing any extension
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: ObjectAccess> ObjectAccess for ExtendableObject<T> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match self.extension.load() {
            Some((index, ext)) => ext.read(index, &self.inner, sub, offset, buf),
            None => self.inner.read(sub, offset, buf),
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        match self.extension.load() {
            Some((index, ext)) => ext.read_size(index, &self.inner, sub),
            None => self.inner.read_size(sub),
        }
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        match self.extension.load() {
            Some((index, ext)) => ext.write(index, &self.inner, sub, data),
            None => self.inner.write(sub, data),
        }
    }

    fn restore(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        self.inner.restore(sub, data)
    }

    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        match self.extension.load() {
            Some((index, ext)) => ext.begin_partial(index, &self.inner, sub),
            None => self.inner.begin_partial(sub),
        }
    }

    fn write_partial(&self, sub: u8, buf: &[u8]) -> Result<(), AbortCode> {
        match self.extension.load() {
            Some((index, ext)) => ext.write_partial(index, &self.inner, sub, buf),
            None => self.inner.write_partial(sub, buf),
        }
    }

    fn end_partial(&self, sub: u8) -> Result<(), AbortCode> {
        match self.extension.load() {
            Some((index, ext)) => ext.end_partial(index, &self.inner, sub),
            None => self.inner.end_partial(sub),
        }
    }

    fn object_code(&self) -> ObjectCode {
        self.inner.object_code()
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        self.inner.sub_info(sub)
    }

    fn set_extension(
        &self,
        index: u16,
        ext: Option<&'static dyn ObjectExtension>,
    ) -> Result<(), AbortCode> {
        self.extension.store(ext.map(|ext| (index, ext)));
        Ok(())
    }

    fn set_event_flag(&self, sub: u8) -> Result<(), AbortCode> {
        self.inner.set_event_flag(sub)
    }

    fn read_event_flag(&self, sub: u8) -> bool {
        self.inner.read_event_flag(sub)
    }

    fn clear_events(&self) {
        self.inner.clear_events()
    }
}

/// Represents one item in the in-memory table of objects
#[allow(missing_debug_implementations)]
pub struct ODEntry<'a> {
    /// The object index
    pub index: u16,
    /// The object implementation
    pub data: &'a dyn ObjectAccess,
}

/// Lookup an object from the Object dictionary table
///
/// Note: `table` must be sorted by index
pub fn find_object<'a>(table: &[ODEntry<'a>], index: u16) -> Option<&'a dyn ObjectAccess> {
    find_object_entry(table, index).map(|entry| entry.data)
}

/// Lookup an entry from the object dictionary table
///
/// The same as [find_object], except that it returned the `&ODEntry` instead of the `&ObjectData`
/// it owns
///
/// Note: `table` must be sorted by index
pub fn find_object_entry<'a, 'b>(table: &'b [ODEntry<'a>], index: u16) -> Option<&'b ODEntry<'a>> {
    table
        .binary_search_by_key(&index, |e| e.index)
        .ok()
        .map(|i| &table[i])
}

/// Install an extension on the object at `index`
///
/// Replaces any extension previously installed on the object. Fails with
/// [`AbortCode::NoSuchObject`] if the object does not exist, or [`AbortCode::UnsupportedAccess`]
/// if the object can not be extended.
pub fn extension_init(
    table: &[ODEntry<'_>],
    index: u16,
    ext: &'static dyn ObjectExtension,
) -> Result<(), AbortCode> {
    let object = find_object(table, index).ok_or(AbortCode::NoSuchObject)?;
    object.set_extension(index, Some(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{ByteField, ObjectFlagSync, ObjectFlags, OdStream, ScalarField};
    use canode_common::objects::PdoMapping;

    struct Doubler;

    impl ObjectExtension for Doubler {
        fn write(
            &self,
            index: u16,
            object: &dyn ObjectAccess,
            sub: u8,
            data: &[u8],
        ) -> Result<(), AbortCode> {
            assert_eq!(0x2000, index);
            let value = u16::from_le_bytes(
                data.try_into()
                    .map_err(|_| AbortCode::DataTypeMismatch)?,
            );
            object.write(sub, &(value * 2).to_le_bytes())
        }
    }

    struct Rejecter;

    impl ObjectExtension for Rejecter {
        fn write(&self, _: u16, _: &dyn ObjectAccess, _: u8, _: &[u8]) -> Result<(), AbortCode> {
            Err(AbortCode::CantStore)
        }
    }

    /// Counts the bytes of partial writes, and refuses values over `limit`
    struct PartialCounter {
        limit: usize,
        count: AtomicCell<usize>,
        ended: AtomicCell<bool>,
    }

    impl ObjectExtension for PartialCounter {
        fn begin_partial(&self, _: u16, object: &dyn ObjectAccess, sub: u8) -> Result<(), AbortCode> {
            self.count.store(0);
            self.ended.store(false);
            object.begin_partial(sub)
        }

        fn write_partial(
            &self,
            _: u16,
            object: &dyn ObjectAccess,
            sub: u8,
            buf: &[u8],
        ) -> Result<(), AbortCode> {
            if self.count.fetch_add(buf.len()) + buf.len() > self.limit {
                return Err(AbortCode::OutOfMemory);
            }
            object.write_partial(sub, buf)
        }

        fn end_partial(&self, _: u16, object: &dyn ObjectAccess, sub: u8) -> Result<(), AbortCode> {
            self.ended.store(true);
            object.end_partial(sub)
        }
    }

    static DOUBLER: Doubler = Doubler;
    static REJECTER: Rejecter = Rejecter;

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    #[test]
    fn test_extension_replaces_previous() {
        let obj = leak(ExtendableObject::new(VarObject::new(
            ScalarField::<u16>::new(0),
            SubInfo::new_u16().rw_access(),
        )));
        let od = leak([ODEntry {
            index: 0x2000,
            data: obj,
        }]);

        obj.write(0, &5u16.to_le_bytes()).unwrap();
        assert_eq!(5, obj.read_u16(0).unwrap());

        extension_init(od, 0x2000, &DOUBLER).unwrap();
        obj.write(0, &5u16.to_le_bytes()).unwrap();
        assert_eq!(10, obj.read_u16(0).unwrap());

        extension_init(od, 0x2000, &REJECTER).unwrap();
        assert_eq!(Err(AbortCode::CantStore), obj.write(0, &1u16.to_le_bytes()));
        assert_eq!(10, obj.read_u16(0).unwrap());

        // Restore bypasses the extension
        obj.restore(0, &3u16.to_le_bytes()).unwrap();
        assert_eq!(3, obj.read_u16(0).unwrap());
    }

    #[test]
    fn test_extension_sees_partial_writes() {
        let obj = leak(ExtendableObject::new(VarObject::new(
            ByteField::new([0u8; 64]),
            SubInfo::new_octet_str(64).rw_access(),
        )));
        let od = leak([ODEntry {
            index: 0x2001,
            data: obj,
        }]);
        let counter = leak(PartialCounter {
            limit: 64,
            count: AtomicCell::new(0),
            ended: AtomicCell::new(false),
        });
        extension_init(od, 0x2001, counter).unwrap();

        let data: [u8; 64] = core::array::from_fn(|i| i as u8);
        let mut stream = OdStream::open(&od[0], 0).unwrap();
        for (i, chunk) in data.chunks(28).enumerate() {
            stream.write(chunk, i == 2).unwrap();
        }
        assert_eq!(64, counter.count.load());
        assert!(counter.ended.load());
        let mut buf = [0u8; 64];
        obj.read(0, 0, &mut buf).unwrap();
        assert_eq!(data, buf);

        // A refused piece abandons the write through the extension
        let counter = leak(PartialCounter {
            limit: 30,
            count: AtomicCell::new(0),
            ended: AtomicCell::new(false),
        });
        extension_init(od, 0x2001, counter).unwrap();
        let mut stream = OdStream::open(&od[0], 0).unwrap();
        stream.write(&[0xFF; 28], false).unwrap();
        assert_eq!(Err(AbortCode::OutOfMemory), stream.write(&[0xFF; 28], false));
        assert!(counter.ended.load());
    }

    #[test]
    fn test_extension_init_errors() {
        let obj = leak(VarObject::new(ScalarField::<u8>::new(0), SubInfo::new_u8()));
        let od = leak([ODEntry {
            index: 0x2000,
            data: obj,
        }]);
        assert_eq!(
            Err(AbortCode::NoSuchObject),
            extension_init(od, 0x2001, &DOUBLER)
        );
        assert_eq!(
            Err(AbortCode::UnsupportedAccess),
            extension_init(od, 0x2000, &DOUBLER)
        );
    }

    #[test]
    fn test_array_object() {
        let sync = leak(ObjectFlagSync::new());
        let flags = leak(ObjectFlags::<1>::new(sync));
        let array = ArrayObject::new_with_flags(
            [ScalarField::<u8>::new(1), ScalarField::<u8>::new(2)],
            SubInfo::new_u8().rw_access().mapping(PdoMapping::Tpdo),
            flags,
        );
        assert_eq!(ObjectCode::Array, ObjectAccess::object_code(&array));
        assert_eq!(2, array.max_sub_number());
        assert_eq!(2, array.read_u8(2).unwrap());
        assert_eq!(Err(AbortCode::NoSuchSubIndex), array.read_u8(3));
        assert_eq!(Err(AbortCode::ReadOnly), array.write(0, &[5]));

        array.set_event_flag(1).unwrap();
        sync.toggle();
        assert!(array.read_event_flag(1));
        assert!(!array.read_event_flag(2));
    }

    #[test]
    fn test_var_object_access() {
        let var = VarObject::new(ScalarField::<u32>::new(7), SubInfo::new_u32());
        assert_eq!(7, var.read_u32(0).unwrap());
        assert_eq!(Err(AbortCode::ReadOnly), var.write(0, &[0; 4]));
        assert_eq!(Err(AbortCode::NoSuchSubIndex), var.read_u32(1));
        assert_eq!(
            Err(AbortCode::UnsupportedAccess),
            var.set_event_flag(0)
        );
    }
}
