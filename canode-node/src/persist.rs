//! Serialization of persisted object values
//!
//! Values are stored as a sequence of records, each a u16 length followed by the record bytes.
//! The only record kind in use holds one sub object value:
//!
//! ```text
//! len: u16 | kind: u8 = 1 | index: u16 | sub: u8 | data: [u8; len - 4]
//! ```
//!
//! Serialization runs as a small state machine which produces one byte per poll, and is exposed to
//! storage backends as an [`embedded_io::Read`], so no buffer for the whole image is needed.
use core::{
    cell::RefCell,
    convert::Infallible,
    future::Future,
    ops::RangeInclusive,
    pin::{pin, Pin},
    task::Context,
};

use futures::{pending, task::noop_waker_ref};

use defmt_or_log::{debug, warn};

use crate::object_dict::{find_object, od_lock, ODEntry};

/// Size of the copy taken of a value before it is serialized
const SNAPSHOT_SIZE: usize = 32;

/// Specifies the types of records which can be serialized to persistent storage
#[derive(Debug, Copy, Clone, PartialEq)]
#[repr(u8)]
pub enum NodeType {
    /// A record containing a saved sub-object value
    ObjectValue = 1,
    /// An unrecognized record type
    Unknown,
}

impl NodeType {
    /// Create a `NodeType` from an ID byte
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::ObjectValue,
            _ => Self::Unknown,
        }
    }
}

async fn write_bytes(bytes: &[u8], reg: &RefCell<u8>) {
    for b in bytes {
        *reg.borrow_mut() = *b;
        pending!()
    }
}

/// Iterate the persisted sub objects of all objects with an index in `range`
fn persisted_subs<'a>(
    od: &'a [ODEntry<'static>],
    range: &'a RangeInclusive<u16>,
) -> impl Iterator<Item = (&'a ODEntry<'static>, u8)> + 'a {
    od.iter()
        .filter(move |entry| range.contains(&entry.index))
        .flat_map(|entry| {
            (0..=entry.data.max_sub_number()).filter_map(move |sub| {
                // Records may have gaps in their sub indices
                let info = entry.data.sub_info(sub).ok()?;
                info.persist.then_some((entry, sub))
            })
        })
}

async fn serialize_object(entry: &ODEntry<'static>, sub: u8, reg: &RefCell<u8>) {
    let data_size = entry.data.read_size(sub).unwrap_or(0) as u16;
    // Record length covers the node type (u8), index (u16) and sub index (u8)
    let node_size = data_size + 4;

    write_bytes(&node_size.to_le_bytes(), reg).await;
    write_bytes(&[NodeType::ObjectValue as u8], reg).await;
    write_bytes(&entry.index.to_le_bytes(), reg).await;
    write_bytes(&[sub], reg).await;

    let data_size = data_size as usize;
    let mut chunk = [0u8; SNAPSHOT_SIZE];
    let mut pos = 0;
    while pos < data_size {
        let len = (data_size - pos).min(SNAPSHOT_SIZE);
        // Values up to SNAPSHOT_SIZE bytes are copied in one piece, so a concurrent write
        // cannot tear them
        od_lock(|| snapshot(entry, sub, pos, &mut chunk[..len]));
        write_bytes(&chunk[..len], reg).await;
        pos += len;
    }
}

/// Copy the value of `sub` from `offset` into `buf`
///
/// A value which shrank since its size was read is padded with zeros.
fn snapshot(entry: &ODEntry<'static>, sub: u8, offset: usize, buf: &mut [u8]) {
    let mut n = 0;
    while n < buf.len() {
        match entry.data.read(sub, offset + n, &mut buf[n..]) {
            Ok(count) if count > 0 => n += count,
            _ => break,
        }
    }
    buf[n..].fill(0);
}

async fn serialize_sm(od: &[ODEntry<'static>], range: RangeInclusive<u16>, reg: &RefCell<u8>) {
    for (entry, sub) in persisted_subs(od, &range) {
        serialize_object(entry, sub, reg).await;
    }
}

struct PersistSerializer<'a, 'b, F: Future> {
    f: Pin<&'a mut F>,
    reg: &'b RefCell<u8>,
    done: bool,
}

impl<'a, 'b, F: Future> PersistSerializer<'a, 'b, F> {
    pub fn new(f: Pin<&'a mut F>, reg: &'b RefCell<u8>) -> Self {
        Self { f, reg, done: false }
    }
}

impl<F: Future> embedded_io::ErrorType for PersistSerializer<'_, '_, F> {
    type Error = Infallible;
}

impl<F: Future> embedded_io::Read for PersistSerializer<'_, '_, F> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut pos = 0;
        loop {
            if pos >= buf.len() || self.done {
                return Ok(pos);
            }

            match self.f.as_mut().poll(&mut cx) {
                core::task::Poll::Ready(_) => {
                    // A completed future must not be polled again
                    self.done = true;
                    return Ok(pos);
                }
                core::task::Poll::Pending => {
                    buf[pos] = *self.reg.borrow();
                    pos += 1;
                }
            }
        }
    }
}

/// The number of bytes [`serialize`] produces for the objects in `range`
pub fn serialized_size(od: &[ODEntry<'static>], range: RangeInclusive<u16>) -> usize {
    persisted_subs(od, &range)
        .map(|(entry, sub)| entry.data.read_size(sub).unwrap_or(0) + 6)
        .sum()
}

/// Serialize the persisted values of all objects with an index in `range`
///
/// `callback` receives a reader producing the serialized bytes, and the expected number of bytes.
pub fn serialize<R>(
    od: &[ODEntry<'static>],
    range: RangeInclusive<u16>,
    callback: impl FnOnce(&mut dyn embedded_io::Read<Error = Infallible>, usize) -> R,
) -> R {
    let size = serialized_size(od, range.clone());
    let reg = RefCell::new(0);
    let fut = pin!(serialize_sm(od, range, &reg));
    let mut serializer = PersistSerializer::new(fut, &reg);
    callback(&mut serializer, size)
}

/// Error which can be returned while reading persisted data
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PersistReadError {
    /// Not enough bytes were present to construct the record
    NodeLengthShort,
}

/// The data for an ObjectValue record
#[derive(Debug, PartialEq)]
pub struct ObjectValue<'a> {
    /// The object index this value belongs to
    pub index: u16,
    /// The sub-object index this value belongs to
    pub sub: u8,
    /// The raw bytes to be restored to the sub object
    pub data: &'a [u8],
}

/// A reference to a single record within a slice of serialized data
#[derive(Debug, PartialEq)]
pub enum PersistNodeRef<'a> {
    /// A saved value for a sub-object
    ObjectValue(ObjectValue<'a>),
    /// An unrecognized record type, including the type byte
    Unknown(&'a [u8]),
}

impl<'a> PersistNodeRef<'a> {
    /// Create a PersistNodeRef from a slice of bytes
    pub fn from_slice(data: &'a [u8]) -> Result<Self, PersistReadError> {
        let Some(&kind) = data.first() else {
            return Err(PersistReadError::NodeLengthShort);
        };

        match NodeType::from_byte(kind) {
            NodeType::ObjectValue => {
                if data.len() < 4 {
                    return Err(PersistReadError::NodeLengthShort);
                }
                Ok(Self::ObjectValue(ObjectValue {
                    index: u16::from_le_bytes([data[1], data[2]]),
                    sub: data[3],
                    data: &data[4..],
                }))
            }
            NodeType::Unknown => Ok(PersistNodeRef::Unknown(data)),
        }
    }
}

/// Iterator over the records in a slice of serialized data
///
/// Iteration stops at the first truncated or malformed record.
struct PersistNodeReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PersistNodeReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { buf: data, pos: 0 }
    }
}

impl<'a> Iterator for PersistNodeReader<'a> {
    type Item = PersistNodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.buf.get(self.pos..self.pos + 2)?;
        let length = u16::from_le_bytes([header[0], header[1]]) as usize;
        self.pos += 2;
        let node_slice = self.buf.get(self.pos..self.pos + length)?;
        self.pos += length;

        PersistNodeRef::from_slice(node_slice).ok()
    }
}

/// Load values of objects previously persisted in serialized format
///
/// Values are written with [`ObjectAccess::restore`](crate::object_dict::ObjectAccess::restore),
/// so configuration objects accept them regardless of their run time state. Call this before
/// creating the [`Node`](crate::Node). Returns the number of values restored.
///
/// # Arguments
/// - `od`: The object dictionary where objects will be updated
/// - `stored_data`: A slice of bytes, as previously produced by serialization
pub fn restore_stored_objects(od: &[ODEntry], stored_data: &[u8]) -> usize {
    let mut restored = 0;
    for item in PersistNodeReader::new(stored_data) {
        match item {
            PersistNodeRef::ObjectValue(value) => {
                let Some(obj) = find_object(od, value.index) else {
                    warn!("Saved object 0x{:x} not found in OD", value.index);
                    continue;
                };
                match obj.restore(value.sub, value.data) {
                    Ok(()) => {
                        debug!("Restored 0x{:x}sub{}", value.index, value.sub);
                        restored += 1;
                    }
                    Err(abort_code) => warn!(
                        "Error restoring object 0x{:x}sub{}: {:x}",
                        value.index, value.sub, abort_code as u32
                    ),
                }
            }
            PersistNodeRef::Unknown(id) => warn!("Unknown persisted record type: {}", id[0]),
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dict::{
        ArrayObject, NullTermByteField, ObjectAccess, ScalarField, VarObject,
    };
    use canode_common::objects::SubInfo;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn collect(od: &[ODEntry<'static>], range: RangeInclusive<u16>) -> Vec<u8> {
        serialize(od, range, |reader, _size| {
            const CHUNK_SIZE: usize = 3;
            let mut data = Vec::new();
            let mut buf = [0; CHUNK_SIZE];
            loop {
                let n = reader.read(&mut buf).unwrap();
                data.extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    break;
                }
            }
            data
        })
    }

    #[test]
    fn test_serialize_deserialize() {
        let values = Box::leak(Box::new(ArrayObject::new(
            [ScalarField::<u32>::new(0), ScalarField::<u32>::new(0)],
            SubInfo::new_u32().rw_access().persist(true),
        )));
        let transient = Box::leak(Box::new(VarObject::new(
            ScalarField::<u16>::new(5),
            SubInfo::new_u16().rw_access(),
        )));
        let name = Box::leak(Box::new(VarObject::new(
            NullTermByteField::<15>::new([0; 15]),
            SubInfo::new_visibile_str(15).rw_access().persist(true),
        )));
        let od: &'static [ODEntry<'static>] = Box::leak(Box::new([
            ODEntry {
                index: 0x2000,
                data: values,
            },
            ODEntry {
                index: 0x2001,
                data: transient,
            },
            ODEntry {
                index: 0x3000,
                data: name,
            },
        ]));
        values.write(1, &42u32.to_le_bytes()).unwrap();
        values.write(2, &7u32.to_le_bytes()).unwrap();
        name.write(0, b"test").unwrap();

        let data = collect(od, 0x2000..=0x3000);
        assert_eq!(30, data.len());
        assert_eq!(data.len(), serialized_size(od, 0x2000..=0x3000));

        let mut deser = PersistNodeReader::new(&data);
        assert_eq!(
            deser.next().unwrap(),
            PersistNodeRef::ObjectValue(ObjectValue {
                index: 0x2000,
                sub: 1,
                data: &42u32.to_le_bytes()
            })
        );
        deser.next().unwrap();
        assert_eq!(
            deser.next().unwrap(),
            PersistNodeRef::ObjectValue(ObjectValue {
                index: 0x3000,
                sub: 0,
                data: b"test"
            })
        );
        assert_eq!(deser.next(), None);

        // Only objects in range are included
        assert_eq!(20, collect(od, 0x2000..=0x2FFF).len());

        values.write(1, &0u32.to_le_bytes()).unwrap();
        name.write(0, b"other").unwrap();
        assert_eq!(3, restore_stored_objects(od, &data));
        assert_eq!(42, values.read_u32(1).unwrap());
        let mut buf = [0; 15];
        let n = name.read(0, 0, &mut buf).unwrap();
        assert_eq!(b"test", &buf[..n]);
    }

    #[test]
    fn test_stored_values_are_not_torn() {
        let value: &'static VarObject<ScalarField<u32>> = Box::leak(Box::new(VarObject::new(
            ScalarField::<u32>::new(0x1111_1111),
            SubInfo::new_u32().rw_access().persist(true),
        )));
        let od: &'static [ODEntry<'static>] = Box::leak(Box::new([ODEntry {
            index: 0x2000,
            data: value,
        }]));
        let patterns = [0x1111_1111u32, 0xEEEE_EEEE];
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut i = 0;
                while !done.load(Ordering::Acquire) {
                    value.write(0, &patterns[i % 2].to_le_bytes()).unwrap();
                    i += 1;
                }
            });
            for _ in 0..2000 {
                let data = collect(od, 0x2000..=0x2000);
                let stored = u32::from_le_bytes(data[6..10].try_into().unwrap());
                assert!(patterns.contains(&stored), "torn value 0x{stored:08x}");
            }
            done.store(true, Ordering::Release);
        });
    }

    #[test]
    fn test_truncated_data() {
        let data = [10, 0, 1, 0x00, 0x20, 1, 0xAA];
        assert_eq!(None, PersistNodeReader::new(&data).next());
        assert_eq!(0, restore_stored_objects(&[], &[1]));
    }
}
