//! Sequential byte access to one sub object
//!
//! Transfers which move a value in several pieces (SDO segments and blocks, stored values) go
//! through an [`OdStream`]. Reads advance an offset into the value. Writes of primitive types are
//! staged and committed with a single write once the last piece arrives, so other contexts never
//! see a half written number. Larger values are written through the partial write API.

use canode_common::{objects::SubInfo, sdo::AbortCode};

use super::{find_object_entry, ODEntry, ObjectAccess};

#[derive(Clone, Copy, Debug, PartialEq)]
enum WriteMode {
    Idle,
    Staged(usize),
    Partial,
}

/// A cursor over a single sub object
#[allow(missing_debug_implementations)]
pub struct OdStream<'a> {
    index: u16,
    sub: u8,
    object: &'a dyn ObjectAccess,
    info: SubInfo,
    offset: usize,
    stage: [u8; 8],
    mode: WriteMode,
}

impl<'a> OdStream<'a> {
    /// Open a stream on sub object `sub` of an OD entry
    pub fn open(entry: &ODEntry<'a>, sub: u8) -> Result<Self, AbortCode> {
        let info = entry.data.sub_info(sub)?;
        Ok(Self {
            index: entry.index,
            sub,
            object: entry.data,
            info,
            offset: 0,
            stage: [0; 8],
            mode: WriteMode::Idle,
        })
    }

    /// Look up `index` in the OD and open a stream on `sub`
    pub fn open_index(od: &[ODEntry<'a>], index: u16, sub: u8) -> Result<Self, AbortCode> {
        let entry = find_object_entry(od, index).ok_or(AbortCode::NoSuchObject)?;
        Self::open(entry, sub)
    }

    /// Object index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Sub index
    pub fn sub(&self) -> u8 {
        self.sub
    }

    /// Metadata of the sub object
    pub fn info(&self) -> &SubInfo {
        &self.info
    }

    /// The underlying object
    pub fn object(&self) -> &'a dyn ObjectAccess {
        self.object
    }

    /// Total number of bytes a read of the value returns
    pub fn read_size(&self) -> Result<usize, AbortCode> {
        if !self.info.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        self.object.read_size(self.sub)
    }

    /// Read the next bytes of the value into `buf`, returning how many were read
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if !self.info.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        let n = self.object.read(self.sub, self.offset, buf)?;
        self.offset += n;
        Ok(n)
    }

    /// Move the read position
    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Write the next piece of the value
    ///
    /// `last` must be set on the final piece. On error any partially written value is abandoned and
    /// the stream returns to idle.
    pub fn write(&mut self, data: &[u8], last: bool) -> Result<(), AbortCode> {
        if !self.info.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        let result = self.write_inner(data, last);
        if result.is_err() {
            self.cancel();
        }
        result
    }

    fn write_inner(&mut self, data: &[u8], last: bool) -> Result<(), AbortCode> {
        if let Some(size) = self.info.data_type.primitive_size() {
            let staged = match self.mode {
                WriteMode::Staged(n) => n,
                _ => 0,
            };
            let end = staged + data.len();
            if end > size {
                return Err(AbortCode::DataTypeMismatchLengthHigh);
            }
            self.stage[staged..end].copy_from_slice(data);
            if last {
                self.mode = WriteMode::Idle;
                self.object.write(self.sub, &self.stage[..end])
            } else {
                self.mode = WriteMode::Staged(end);
                Ok(())
            }
        } else {
            if self.mode == WriteMode::Idle {
                if last {
                    return self.object.write(self.sub, data);
                }
                self.object.begin_partial(self.sub)?;
                self.mode = WriteMode::Partial;
            }
            self.object.write_partial(self.sub, data)?;
            if last {
                self.mode = WriteMode::Idle;
                self.object.end_partial(self.sub)?;
            }
            Ok(())
        }
    }

    /// Abandon a write in progress
    ///
    /// Staged primitive values are discarded without touching the object.
    pub fn cancel(&mut self) {
        if self.mode == WriteMode::Partial {
            self.object.end_partial(self.sub).ok();
        }
        self.mode = WriteMode::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{ByteField, ScalarField, VarObject};
    use canode_common::objects::SubInfo;

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    #[test]
    fn test_primitive_write_is_staged() {
        let obj = leak(VarObject::new(
            ScalarField::<u32>::new(0),
            SubInfo::new_u32().rw_access(),
        ));
        let od = [ODEntry {
            index: 0x2000,
            data: obj,
        }];
        let mut stream = OdStream::open_index(&od, 0x2000, 0).unwrap();
        stream.write(&[0x78, 0x56], false).unwrap();
        // Nothing visible until the last piece
        assert_eq!(0, obj.field().load());
        stream.write(&[0x34, 0x12], true).unwrap();
        assert_eq!(0x1234_5678, obj.field().load());

        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthHigh),
            stream.write(&[0; 5], true)
        );
        assert_eq!(
            Err(AbortCode::DataTypeMismatchLengthLow),
            stream.write(&[1, 2], true)
        );
        stream.write(&[1, 2], false).unwrap();
        stream.cancel();
        assert_eq!(0x1234_5678, obj.field().load());
    }

    #[test]
    fn test_partial_write_and_read() {
        let obj = leak(VarObject::new(
            ByteField::new([0u8; 12]),
            SubInfo::new_octet_str(12).rw_access(),
        ));
        let od = [ODEntry {
            index: 0x2100,
            data: obj,
        }];
        let mut stream = OdStream::open_index(&od, 0x2100, 0).unwrap();
        stream.write(&[1; 7], false).unwrap();
        stream.write(&[2; 5], true).unwrap();
        assert_eq!([1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2], obj.field().load());

        let mut stream = OdStream::open_index(&od, 0x2100, 0).unwrap();
        assert_eq!(12, stream.read_size().unwrap());
        let mut buf = [0; 7];
        assert_eq!(7, stream.read(&mut buf).unwrap());
        assert_eq!(5, stream.read(&mut buf).unwrap());
        assert_eq!([2; 5], buf[..5]);
        assert_eq!(0, stream.read(&mut buf).unwrap());
    }

    #[test]
    fn test_open_errors() {
        let obj = leak(VarObject::new(ScalarField::<u8>::new(3), SubInfo::new_u8()));
        let od = [ODEntry {
            index: 0x2000,
            data: obj,
        }];
        assert_eq!(
            Some(AbortCode::NoSuchObject),
            OdStream::open_index(&od, 0x2001, 0).err()
        );
        assert_eq!(
            Some(AbortCode::NoSuchSubIndex),
            OdStream::open_index(&od, 0x2000, 1).err()
        );
        let mut stream = OdStream::open_index(&od, 0x2000, 0).unwrap();
        assert_eq!(Err(AbortCode::ReadOnly), stream.write(&[1], true));
    }
}
