//! Generic storage types implementing a single sub object

use core::cell::UnsafeCell;

use canode_common::{sdo::AbortCode, AtomicCell};

/// Byte level access to the data of a sub object
pub trait SubObjectAccess: Sync + Send {
    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Every sub object supports partial reads. Returns the number of bytes copied into `buf`,
    /// which is zero once `offset` is at or past the end of the data.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// Return the amount of data which can currently be read
    fn read_size(&self) -> usize;

    /// Replace the value of the sub object
    ///
    /// Scalar values require `data` to match their size exactly. Byte and string fields accept
    /// shorter values.
    ///
    /// # Errors
    ///
    /// - [`AbortCode::DataTypeMismatchLengthHigh`] if `data` is longer than the sub object
    /// - [`AbortCode::DataTypeMismatchLengthLow`] if `data` is too short for the sub object
    /// - [`AbortCode::ReadOnly`] if the sub object is constant
    fn write(&self, data: &[u8]) -> Result<(), AbortCode>;

    /// Begin a multi-part write
    ///
    /// A partial write is always one `begin_partial`, any number of `write_partial`, then one
    /// `end_partial`. The caller must not interleave other writes while one is in progress.
    fn begin_partial(&self) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Append the next chunk of a multi-part write
    fn write_partial(&self, _buf: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Finish a multi-part write
    fn end_partial(&self) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }
}

/// Copy `bytes[offset..]` into `buf`, as much as fits
pub(crate) fn read_slice(bytes: &[u8], offset: usize, buf: &mut [u8]) -> usize {
    if offset >= bytes.len() {
        return 0;
    }
    let len = buf.len().min(bytes.len() - offset);
    buf[..len].copy_from_slice(&bytes[offset..offset + len]);
    len
}

/// Interpret `data` as exactly `N` bytes
pub(crate) fn exact_bytes<const N: usize>(data: &[u8]) -> Result<[u8; N], AbortCode> {
    data.try_into().map_err(|_| length_error(data.len(), N))
}

fn length_error(actual: usize, expected: usize) -> AbortCode {
    if actual < expected {
        AbortCode::DataTypeMismatchLengthLow
    } else {
        AbortCode::DataTypeMismatchLengthHigh
    }
}

/// A sub object holding a single primitive value
#[allow(missing_debug_implementations)]
pub struct ScalarField<T: Copy> {
    value: AtomicCell<T>,
}

impl<T: Send + Copy> ScalarField<T> {
    /// Atomically read the value
    pub fn load(&self) -> T {
        self.value.load()
    }

    /// Atomically store a new value
    pub fn store(&self, value: T) {
        self.value.store(value);
    }
}

impl<T: Copy + Default + Send> Default for ScalarField<T> {
    fn default() -> Self {
        Self {
            value: AtomicCell::default(),
        }
    }
}

macro_rules! impl_scalar_field {
    ($($rust_type: ty),*) => {
        $(
        impl ScalarField<$rust_type> {
            /// Create a field holding `value`
            pub const fn new(value: $rust_type) -> Self {
                Self {
                    value: AtomicCell::new(value),
                }
            }
        }

        impl SubObjectAccess for ScalarField<$rust_type> {
            fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
                Ok(read_slice(&self.value.load().to_le_bytes(), offset, buf))
            }

            fn read_size(&self) -> usize {
                core::mem::size_of::<$rust_type>()
            }

            fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
                let bytes = data
                    .try_into()
                    .map_err(|_| length_error(data.len(), core::mem::size_of::<$rust_type>()))?;
                self.value.store(<$rust_type>::from_le_bytes(bytes));
                Ok(())
            }
        }
        )*
    };
}

impl_scalar_field!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl ScalarField<bool> {
    /// Create a field holding `value`
    pub const fn new(value: bool) -> Self {
        Self {
            value: AtomicCell::new(value),
        }
    }
}

// Booleans are a single byte on the bus
impl SubObjectAccess for ScalarField<bool> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(read_slice(&[self.value.load() as u8], offset, buf))
    }

    fn read_size(&self) -> usize {
        1
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        match data {
            [b] => {
                self.value.store(*b != 0);
                Ok(())
            }
            _ => Err(length_error(data.len(), 1)),
        }
    }
}

/// A sub object holding a fixed size byte array
///
/// This is the storage for DOMAIN, OCTET_STRING and the string types. Large fields support
/// partial writes so they can be filled by a segmented or block transfer in several pieces.
#[allow(clippy::len_without_is_empty, missing_debug_implementations)]
pub struct ByteField<const N: usize> {
    value: UnsafeCell<[u8; N]>,
    write_offset: AtomicCell<Option<usize>>,
}

// Safety: value is only accessed inside a critical section
unsafe impl<const N: usize> Sync for ByteField<N> {}

impl<const N: usize> ByteField<N> {
    /// Create a field with an initial value
    pub const fn new(value: [u8; N]) -> Self {
        Self {
            value: UnsafeCell::new(value),
            write_offset: AtomicCell::new(None),
        }
    }

    /// The capacity of the field
    pub fn len(&self) -> usize {
        N
    }

    /// Atomically replace the whole array. Cancels any partial write in progress.
    pub fn store(&self, value: [u8; N]) {
        self.write_offset.store(None);
        critical_section::with(|_| unsafe { *self.value.get() = value });
    }

    /// Atomically read the whole array
    pub fn load(&self) -> [u8; N] {
        critical_section::with(|_| unsafe { *self.value.get() })
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8; N]) -> R) -> R {
        critical_section::with(|_| f(unsafe { &mut *self.value.get() }))
    }
}

impl<const N: usize> Default for ByteField<N> {
    fn default() -> Self {
        Self::new([0; N])
    }
}

impl<const N: usize> SubObjectAccess for ByteField<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(self.with_bytes(|bytes| read_slice(bytes, offset, buf)))
    }

    fn read_size(&self) -> usize {
        N
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.with_bytes(|bytes| bytes[..data.len()].copy_from_slice(data));
        Ok(())
    }

    fn begin_partial(&self) -> Result<(), AbortCode> {
        self.write_offset.store(Some(0));
        Ok(())
    }

    fn write_partial(&self, buf: &[u8]) -> Result<(), AbortCode> {
        let offset = self.write_offset.load().ok_or(AbortCode::GeneralError)?;
        if offset + buf.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.with_bytes(|bytes| bytes[offset..offset + buf.len()].copy_from_slice(buf));
        self.write_offset.store(Some(offset + buf.len()));
        Ok(())
    }

    fn end_partial(&self) -> Result<(), AbortCode> {
        self.write_offset.store(None);
        Ok(())
    }
}

/// A byte field whose current length is marked by a null terminator
///
/// Used for VISIBLE_STRING and UNICODE_STRING, which may hold values shorter than their capacity.
#[allow(clippy::len_without_is_empty, missing_debug_implementations)]
pub struct NullTermByteField<const N: usize>(ByteField<N>);

impl<const N: usize> NullTermByteField<N> {
    /// Create a field with an initial value
    pub const fn new(value: [u8; N]) -> Self {
        Self(ByteField::new(value))
    }

    /// The capacity of the field
    pub fn len(&self) -> usize {
        N
    }

    /// Atomically load the whole array, including any bytes after the terminator
    pub fn load(&self) -> [u8; N] {
        self.0.load()
    }

    /// Atomically store a whole array
    pub fn store(&self, value: [u8; N]) {
        self.0.store(value);
    }

    /// Store a string, null terminating it if it is shorter than the field
    pub fn set_str(&self, value: &[u8]) -> Result<(), AbortCode> {
        self.write(value)
    }
}

impl<const N: usize> Default for NullTermByteField<N> {
    fn default() -> Self {
        Self(ByteField::default())
    }
}

impl<const N: usize> SubObjectAccess for NullTermByteField<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let end = self.read_size();
        if offset >= end {
            return Ok(0);
        }
        let len = buf.len().min(end - offset);
        self.0.read(offset, &mut buf[..len])
    }

    fn read_size(&self) -> usize {
        self.0
            .with_bytes(|bytes| bytes.iter().position(|b| *b == 0).unwrap_or(N))
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.0.with_bytes(|bytes| {
            bytes[..data.len()].copy_from_slice(data);
            if data.len() < N {
                bytes[data.len()] = 0;
            }
        });
        Ok(())
    }

    fn begin_partial(&self) -> Result<(), AbortCode> {
        self.0.begin_partial()
    }

    fn write_partial(&self, data: &[u8]) -> Result<(), AbortCode> {
        self.0.write_partial(data)
    }

    fn end_partial(&self) -> Result<(), AbortCode> {
        if self.0.write_offset.load().unwrap_or(N) < N {
            self.0.write_partial(&[0])?;
        }
        self.0.end_partial()
    }
}

/// A read-only sub object backed by a static byte slice
#[derive(Clone, Copy, Debug)]
pub struct ConstByteRefField {
    value: &'static [u8],
}

impl ConstByteRefField {
    /// Create a field referencing `value`
    pub const fn new(value: &'static [u8]) -> Self {
        Self { value }
    }
}

impl SubObjectAccess for ConstByteRefField {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(read_slice(self.value, offset, buf))
    }

    fn read_size(&self) -> usize {
        self.value.len()
    }

    fn write(&self, _data: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::ReadOnly)
    }
}

/// A read-only sub object whose bytes are fixed at compile time
///
/// Create it from `to_le_bytes()` of the value.
#[derive(Debug)]
pub struct ConstField<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> ConstField<N> {
    /// Create a const field
    pub const fn new(bytes: [u8; N]) -> Self {
        Self { bytes }
    }
}

impl<const N: usize> SubObjectAccess for ConstField<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(read_slice(&self.bytes, offset, buf))
    }

    fn read_size(&self) -> usize {
        N
    }

    fn write(&self, _data: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use canode_common::objects::{ObjectCode, SubInfo};

    use crate::object_dict::{ObjectAccess, ProvidesSubObjects};

    use super::*;

    #[derive(Default)]
    struct DeviceRecord {
        serial: ScalarField<u32>,
        enabled: ScalarField<bool>,
        label: NullTermByteField<10>,
    }

    impl ProvidesSubObjects for DeviceRecord {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                0 => Some((
                    SubInfo::MAX_SUB_NUMBER,
                    const { &ConstField::new(3u8.to_le_bytes()) },
                )),
                1 => Some((SubInfo::new_u32().rw_access(), &self.serial)),
                2 => Some((SubInfo::new_bool().rw_access(), &self.enabled)),
                3 => Some((
                    SubInfo::new_visibile_str(self.label.len()).rw_access(),
                    &self.label,
                )),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Record
        }
    }

    #[test]
    fn test_record_access() {
        let record = DeviceRecord::default();

        assert_eq!(3, record.max_sub_number());
        record.write(1, &42u32.to_le_bytes()).unwrap();
        assert_eq!(42, record.read_u32(1).unwrap());
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthLow),
            record.write(1, &[1, 2])
        );
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthHigh),
            record.write(2, &[1, 0])
        );
        assert_eq!(Err(AbortCode::ReadOnly), record.write(0, &[4]));

        record.begin_partial(3).unwrap();
        record
            .write_partial(3, &[b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j'])
            .unwrap();
        record.end_partial(3).unwrap();
        assert_eq!(10, record.read_size(3).unwrap());

        // A shorter value gets null terminated
        record.begin_partial(3).unwrap();
        record.write_partial(3, b"xy").unwrap();
        record.write_partial(3, b"z").unwrap();
        record.end_partial(3).unwrap();
        assert_eq!(3, record.read_size(3).unwrap());
        let mut buf = [0; 10];
        assert_eq!(3, record.read(3, 0, &mut buf).unwrap());
        assert_eq!(b"xyz", &buf[..3]);
    }

    fn check_reads(field: &dyn SubObjectAccess, expected: &[u8]) {
        let n = expected.len();
        assert!(n > 2);
        assert_eq!(n, field.read_size());

        let mut buf = vec![0xffu8; n + 10];
        assert_eq!(n, field.read(0, &mut buf).unwrap());
        assert_eq!(expected, &buf[..n]);

        let mut buf = vec![0xffu8; n + 10];
        assert_eq!(n - 2, field.read(2, &mut buf).unwrap());
        assert_eq!(&expected[2..], &buf[..n - 2]);

        let mut buf = vec![0xffu8; n - 2];
        assert_eq!(n - 2, field.read(1, &mut buf).unwrap());
        assert_eq!(expected[1..n - 1], buf);

        assert_eq!(0, field.read(n, &mut buf).unwrap());
    }

    #[test]
    fn test_scalar_fields() {
        check_reads(&ScalarField::<u32>::new(0x1234_5678), &0x1234_5678u32.to_le_bytes());
        check_reads(&ScalarField::<i64>::new(-2), &(-2i64).to_le_bytes());
        check_reads(&ScalarField::<f64>::new(1.5), &1.5f64.to_le_bytes());

        let field = ScalarField::<u16>::new(0);
        field.write(&1000u16.to_le_bytes()).unwrap();
        assert_eq!(1000, field.load());
    }

    #[test]
    fn test_byte_field() {
        let field = ByteField::new([0; 10]);
        let data = Vec::from_iter(0u8..10);
        field.write(&data).unwrap();
        check_reads(&field, &data);
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthHigh),
            field.write(&[0; 11])
        );

        // Partial writes must be started first
        assert_eq!(Err(AbortCode::GeneralError), field.write_partial(&[1]));
        field.begin_partial().unwrap();
        field.write_partial(&[9; 6]).unwrap();
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthHigh),
            field.write_partial(&[9; 5])
        );
        field.end_partial().unwrap();
    }

    #[test]
    fn test_null_term_byte_field() {
        let field = NullTermByteField::new([0; 10]);
        field.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        check_reads(&field, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        field.set_str(&[1, 2, 3, 4]).unwrap();
        check_reads(&field, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_const_fields() {
        check_reads(&ConstField::new([1, 2, 3, 4, 5]), &[1, 2, 3, 4, 5]);
        check_reads(&ConstByteRefField::new(&[1, 2, 3, 4, 5]), &[1, 2, 3, 4, 5]);
        assert_eq!(
            Err(AbortCode::ReadOnly),
            ConstField::new([0u8]).write(&[1])
        );
    }
}
