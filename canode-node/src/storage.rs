//! Non-volatile storage of object values
//!
//! Storage is split into entries. Each [`StorageEntry`] covers a range of object indices and is
//! persisted as one image by a [`StorageBackend`]. An image is the serialized `persist` sub
//! objects of the entry's objects, followed by a CRC trailer:
//!
//! ```text
//! payload: [u8; N] | crc: u16 (CRC-16-CCITT of payload, little endian)
//! ```
//!
//! An image consisting of the marker `"-\n"` is written when defaults are restored, and loads as
//! if nothing had been stored.
//!
//! The storage is controlled over the bus through objects 0x1010 (store parameters) and 0x1011
//! (restore default parameters). Writing the signature `"save"` to 0x1010 sub k stores the entry
//! whose sub index is k. Writing `"load"` to 0x1011 sub k replaces the image of that entry with the
//! restore marker; the defaults take effect after the next reset. Sub 1 selects all entries.
use core::convert::Infallible;

use crc16::CrcType as _;
use defmt_or_log::{error, info, warn};
use snafu::Snafu;

use canode_common::{
    constants::{object_ids, values},
    sdo::AbortCode,
    AtomicCell,
};

use crate::{
    emcy::{error_code, error_bit, Emergency},
    object_dict::{exact_bytes, extension_init, read_slice, ODEntry, ObjectAccess, ObjectExtension},
    persist::{restore_stored_objects, serialize},
};

/// Image written by a restore command
pub const RESTORE_MARKER: &[u8] = b"-\n";

/// Error returned by storage operations
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// A file system operation failed
    #[cfg(feature = "std")]
    #[snafu(display("Storage IO error: {source}"))]
    Io {
        /// The underlying IO error
        source: std::io::Error,
    },
    /// A backend specific failure
    #[snafu(display("Storage backend error {code}"))]
    Backend {
        /// Backend defined error code
        code: u32,
    },
    /// The CRC trailer of an image does not match its payload
    #[snafu(display("Storage CRC mismatch: stored {stored:#06x}, computed {computed:#06x}"))]
    CrcMismatch {
        /// The CRC found in the image
        stored: u16,
        /// The CRC of the payload
        computed: u16,
    },
    /// An image is too short to hold a CRC trailer
    #[snafu(display("Storage image of {len} bytes is malformed"))]
    Format {
        /// Length of the image
        len: usize,
    },
    /// No backend was registered
    #[snafu(display("No storage backend registered"))]
    NotRegistered,
    /// One or more entries could not be loaded
    ///
    /// Bit n of `bitmap` is set for a failing entry with sub index n. Entries with a sub index of
    /// 31 or above share bit 31.
    #[snafu(display("Stored data corrupt: {bitmap:#010x}"))]
    DataCorrupt {
        /// Failing entries
        bitmap: u32,
    },
}

/// Selects which operations a [`StorageEntry`] supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageAttributes {
    /// Stored when the store command is written to 0x1010
    pub cmd: bool,
    /// Stored automatically when its values change, if auto save is enabled
    pub auto: bool,
    /// May be reset to defaults through 0x1011
    pub restore: bool,
}

impl StorageAttributes {
    /// Store on command and allow restore
    pub const fn on_command() -> Self {
        Self {
            cmd: true,
            auto: false,
            restore: true,
        }
    }

    /// Store automatically and allow restore
    pub const fn automatic() -> Self {
        Self {
            cmd: false,
            auto: true,
            restore: true,
        }
    }

    /// Enable every operation
    pub const fn all() -> Self {
        Self {
            cmd: true,
            auto: true,
            restore: true,
        }
    }
}

/// A group of objects which is stored as one image
#[allow(missing_debug_implementations)]
pub struct StorageEntry {
    sub: u8,
    name: &'static str,
    first_index: u16,
    last_index: u16,
    attributes: StorageAttributes,
    crc: AtomicCell<Option<u16>>,
}

impl StorageEntry {
    /// Create an entry
    ///
    /// # Arguments
    /// - `sub`: The sub index of 0x1010 / 0x1011 which controls this entry, 2..=254. Entries are
    ///   also controlled by sub 1.
    /// - `name`: The name of the image in the backend
    /// - `first_index`, `last_index`: The range of objects stored in the image
    /// - `attributes`: The supported operations
    ///
    /// # Panics
    ///
    /// Panics if `sub` is outside 2..=254. In a static initializer this is a compile error.
    pub const fn new(
        sub: u8,
        name: &'static str,
        first_index: u16,
        last_index: u16,
        attributes: StorageAttributes,
    ) -> Self {
        assert!(sub >= 2 && sub <= 254, "storage sub index must be 2..=254");
        Self {
            sub,
            name,
            first_index,
            last_index,
            attributes,
            crc: AtomicCell::new(None),
        }
    }

    /// The controlling sub index
    pub fn sub(&self) -> u8 {
        self.sub
    }

    /// The image name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The CRC of the last image stored or loaded, if any
    pub fn crc(&self) -> Option<u16> {
        self.crc.load()
    }

    fn range(&self) -> core::ops::RangeInclusive<u16> {
        self.first_index..=self.last_index
    }

    fn error_bit(&self) -> u32 {
        1 << self.sub.min(31)
    }
}

/// Persists storage images
///
/// Implementations must make a store atomic: after a failed or interrupted store, a later load
/// must produce either the previous image or the new one.
pub trait StorageBackend: Sync {
    /// Persist the image `name`
    ///
    /// `reader` produces exactly `size` bytes.
    fn store(
        &self,
        name: &str,
        reader: &mut dyn embedded_io::Read<Error = Infallible>,
        size: usize,
    ) -> Result<(), StorageError>;

    /// Read back the image `name`, and pass it to `f`
    ///
    /// An image which was never stored is passed as an empty slice.
    fn load(
        &self,
        name: &str,
        f: &mut dyn FnMut(&[u8]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;
}

/// Reader which appends the CRC of everything read from `inner`
///
/// The end of `inner` is detected by a short read, after which `inner` is not read again.
struct CrcReader<'a> {
    inner: &'a mut dyn embedded_io::Read<Error = Infallible>,
    crc: u16,
    trailer: Option<[u8; 2]>,
    trailer_pos: usize,
}

impl<'a> CrcReader<'a> {
    fn new(inner: &'a mut dyn embedded_io::Read<Error = Infallible>) -> Self {
        Self {
            inner,
            crc: crc16::XMODEM::init(),
            trailer: None,
            trailer_pos: 0,
        }
    }
}

impl embedded_io::ErrorType for CrcReader<'_> {
    type Error = Infallible;
}

impl embedded_io::Read for CrcReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        if self.trailer.is_none() {
            n = self.inner.read(buf)?;
            self.crc = crc16::XMODEM::update(self.crc, &buf[..n]);
            if n == buf.len() {
                return Ok(n);
            }
            self.trailer = Some(crc16::XMODEM::get(self.crc).to_le_bytes());
        }
        let Some(trailer) = self.trailer else {
            return Ok(n);
        };
        let remaining = &trailer[self.trailer_pos..];
        let count = remaining.len().min(buf.len() - n);
        buf[n..n + count].copy_from_slice(&remaining[..count]);
        self.trailer_pos += count;
        Ok(n + count)
    }
}

fn read_all(reader: &mut dyn embedded_io::Read<Error = Infallible>, buf: &mut [u8]) -> usize {
    match reader.read(buf) {
        Ok(n) => n,
        Err(never) => match never {},
    }
}

fn image_crc(payload: &[u8]) -> u16 {
    crc16::XMODEM::get(crc16::XMODEM::update(crc16::XMODEM::init(), payload))
}

/// Check the CRC trailer of a stored image and return its payload
///
/// Returns `None` for an empty image or the restore marker.
pub fn verify_image(image: &[u8]) -> Result<Option<&[u8]>, StorageError> {
    if image.is_empty() || image == RESTORE_MARKER {
        return Ok(None);
    }
    if image.len() < 2 {
        return FormatSnafu { len: image.len() }.fail();
    }
    let (payload, trailer) = image.split_at(image.len() - 2);
    let stored = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = image_crc(payload);
    if stored != computed {
        return CrcMismatchSnafu { stored, computed }.fail();
    }
    Ok(Some(payload))
}

/// Compute the CRC the image of `range` would have if stored now
fn current_crc(od: &[ODEntry<'static>], range: core::ops::RangeInclusive<u16>) -> u16 {
    serialize(od, range, |reader, _size| {
        let mut crc = crc16::XMODEM::init();
        let mut buf = [0u8; 32];
        loop {
            let n = read_all(reader, &mut buf);
            crc = crc16::XMODEM::update(crc, &buf[..n]);
            if n < buf.len() {
                break;
            }
        }
        crc16::XMODEM::get(crc)
    })
}

/// Storage state, owned by the node state
///
/// Entries and a backend are registered by the application with [`Storage::register`] before the
/// node is created. [`Storage::load`] then restores the stored values.
#[allow(missing_debug_implementations)]
pub struct Storage {
    entries: AtomicCell<&'static [StorageEntry]>,
    backend: AtomicCell<Option<&'static dyn StorageBackend>>,
    od: AtomicCell<Option<&'static [ODEntry<'static>]>>,
    sub1_all: AtomicCell<bool>,
    auto_save: AtomicCell<bool>,
    load_errors: AtomicCell<u32>,
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage {
    /// Create a storage with no entries
    pub const fn new() -> Self {
        Self {
            entries: AtomicCell::new(&[]),
            backend: AtomicCell::new(None),
            od: AtomicCell::new(None),
            sub1_all: AtomicCell::new(true),
            auto_save: AtomicCell::new(false),
            load_errors: AtomicCell::new(0),
        }
    }

    /// Register the storage entries and the backend which persists them
    pub fn register(
        &self,
        entries: &'static [StorageEntry],
        backend: &'static dyn StorageBackend,
    ) {
        self.entries.store(entries);
        self.backend.store(Some(backend));
    }

    /// Enable automatic saving of entries with the `auto` attribute
    pub fn set_auto_save(&self, enabled: bool) {
        self.auto_save.store(enabled);
    }

    /// Select whether sub 1 of 0x1010 / 0x1011 controls all entries. Enabled by default.
    pub fn set_sub1_all(&self, enabled: bool) {
        self.sub1_all.store(enabled);
    }

    /// The registered entries
    pub fn entries(&self) -> &'static [StorageEntry] {
        self.entries.load()
    }

    /// Restore all entries from the backend into `od`
    ///
    /// An entry which was never stored, or was reset with the restore command, keeps its default
    /// values. Entries which fail to load keep their defaults, and are reported together in
    /// [`StorageError::DataCorrupt`]. The failure is also reported as an emergency when the node
    /// starts.
    pub fn load(&self, od: &'static [ODEntry<'static>]) -> Result<(), StorageError> {
        let backend = self.backend.load().ok_or(StorageError::NotRegistered)?;
        let mut bitmap = 0;
        for entry in self.entries.load() {
            let result = backend.load(entry.name, &mut |image: &[u8]| {
                if let Some(payload) = verify_image(image)? {
                    let count = restore_stored_objects(od, payload);
                    entry.crc.store(Some(image_crc(payload)));
                    info!("Loaded {} values from storage entry {}", count, entry.sub);
                }
                Ok(())
            });
            if result.is_err() {
                error!("Loading storage entry {} failed", entry.sub);
                bitmap |= entry.error_bit();
            }
        }
        self.load_errors.store(bitmap);
        if bitmap != 0 {
            DataCorruptSnafu { bitmap }.fail()
        } else {
            Ok(())
        }
    }

    /// Install the 0x1010 / 0x1011 handlers on `od`
    pub(crate) fn init(&'static self, od: &'static [ODEntry<'static>]) {
        self.od.store(Some(od));
        for index in [object_ids::SAVE_OBJECTS, object_ids::RESTORE_OBJECTS] {
            if extension_init(od, index, self).is_err() {
                warn!("Object 0x{:x} missing, storage commands unavailable", index);
            }
        }
    }

    /// Take the failure bitmap of the last [`Storage::load`]
    pub(crate) fn take_load_errors(&self) -> u32 {
        self.load_errors.swap(0)
    }

    /// Store one entry through the backend
    pub fn store_entry(&self, entry: &StorageEntry) -> Result<(), StorageError> {
        let backend = self.backend.load().ok_or(StorageError::NotRegistered)?;
        let od = self.od.load().ok_or(StorageError::NotRegistered)?;
        let crc = serialize(od, entry.range(), |reader, size| {
            let mut reader = CrcReader::new(reader);
            backend.store(entry.name, &mut reader, size + 2)?;
            Ok::<_, StorageError>(crc16::XMODEM::get(reader.crc))
        })?;
        entry.crc.store(Some(crc));
        Ok(())
    }

    /// Reset one entry to defaults, effective on the next load
    pub fn restore_entry(&self, entry: &StorageEntry) -> Result<(), StorageError> {
        let backend = self.backend.load().ok_or(StorageError::NotRegistered)?;
        let mut marker = RESTORE_MARKER;
        backend.store(entry.name, &mut marker, RESTORE_MARKER.len())?;
        entry.crc.store(None);
        Ok(())
    }

    /// Auto save pass, run once per node cycle
    ///
    /// Entries with the `auto` attribute are stored when the CRC of their current values differs
    /// from the last stored image.
    pub(crate) fn process(&self, emcy: &Emergency) {
        if !self.auto_save.load() {
            return;
        }
        let Some(od) = self.od.load() else {
            return;
        };
        let mut failed = false;
        for entry in self.entries.load().iter().filter(|e| e.attributes.auto) {
            if entry.crc.load() == Some(current_crc(od, entry.range())) {
                continue;
            }
            if self.store_entry(entry).is_err() {
                error!("Auto save of storage entry {} failed", entry.sub);
                failed = true;
            }
        }
        if failed {
            emcy.error_report(
                error_bit::NON_VOLATILE_AUTO_SAVE,
                error_code::HARDWARE,
                0,
            );
        } else {
            emcy.error_reset(error_bit::NON_VOLATILE_AUTO_SAVE, 0);
        }
    }

    fn matching(&self, sub: u8) -> impl Iterator<Item = &'static StorageEntry> {
        let all = sub == 1 && self.sub1_all.load();
        self.entries
            .load()
            .iter()
            .filter(move |entry| all || entry.sub == sub)
    }

    fn command_value(&self, index: u16, sub: u8) -> u32 {
        let auto_save = self.auto_save.load();
        self.matching(sub).fold(0, |value, entry| {
            let supported = if index == object_ids::SAVE_OBJECTS {
                entry.attributes.cmd
            } else {
                entry.attributes.restore
            };
            let auto = index == object_ids::SAVE_OBJECTS && auto_save && entry.attributes.auto;
            value | supported as u32 | (auto as u32) << 1
        })
    }
}

impl ObjectExtension for Storage {
    fn read(
        &self,
        index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, AbortCode> {
        if sub == 0 {
            return object.read(sub, offset, buf);
        }
        object.sub_info(sub)?;
        let value = self.command_value(index, sub);
        Ok(read_slice(&value.to_le_bytes(), offset, buf))
    }

    fn read_size(&self, _index: u16, object: &dyn ObjectAccess, sub: u8) -> Result<usize, AbortCode> {
        if sub == 0 {
            return object.read_size(sub);
        }
        object.sub_info(sub)?;
        Ok(4)
    }

    fn write(
        &self,
        index: u16,
        _object: &dyn ObjectAccess,
        sub: u8,
        data: &[u8],
    ) -> Result<(), AbortCode> {
        if sub == 0 || self.backend.load().is_none() {
            return Err(AbortCode::ReadOnly);
        }
        let value = u32::from_le_bytes(exact_bytes::<4>(data)?);
        let store = index == object_ids::SAVE_OBJECTS;
        let signature = if store {
            values::SAVE_CMD
        } else {
            values::LOAD_CMD
        };
        if value != signature {
            return Err(AbortCode::CantStore);
        }

        let mut found = false;
        let mut handled = false;
        let mut result = Ok(());
        for entry in self.matching(sub) {
            found = true;
            let (allowed, outcome) = if store {
                (entry.attributes.cmd, StorageOp::Store)
            } else {
                (entry.attributes.restore, StorageOp::Restore)
            };
            if !allowed {
                continue;
            }
            handled = true;
            let op = match outcome {
                StorageOp::Store => self.store_entry(entry),
                StorageOp::Restore => self.restore_entry(entry),
            };
            match op {
                Ok(()) => info!("Storage entry {} {}", entry.sub, outcome.as_str()),
                Err(_) => {
                    error!("Storage entry {} {} failed", entry.sub, outcome.as_str());
                    result = Err(AbortCode::HardwareError);
                }
            }
        }

        if handled {
            result
        } else if found {
            Err(AbortCode::ReadOnly)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

#[derive(Clone, Copy)]
enum StorageOp {
    Store,
    Restore,
}

impl StorageOp {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOp::Store => "stored",
            StorageOp::Restore => "restored to defaults",
        }
    }
}

#[cfg(feature = "std")]
pub use file_storage::FileStorage;

#[cfg(feature = "std")]
mod file_storage {
    use std::path::PathBuf;

    use snafu::ResultExt as _;

    use super::*;

    /// Stores each entry image as a file in a directory
    ///
    /// A store writes `<name>.tmp` and verifies it, moves the previous image to `<name>.old`, and
    /// then renames the new file into place. If the current image is missing or fails its CRC at
    /// load time, the `.old` image is used.
    #[derive(Debug, Clone)]
    pub struct FileStorage {
        dir: PathBuf,
    }

    impl FileStorage {
        /// Create a file storage in `dir`. The directory is created on the first store.
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        /// Create a file storage from the `[storage]` table of a node config file
        ///
        /// Returns None when no path is configured.
        pub fn from_config(config: &canode_common::node_config::StorageConfig) -> Option<Self> {
            config.path.as_ref().map(|path| Self::new(path.clone()))
        }

        fn path(&self, name: &str, suffix: &str) -> PathBuf {
            self.dir.join(format!("{name}{suffix}"))
        }
    }

    impl StorageBackend for FileStorage {
        fn store(
            &self,
            name: &str,
            reader: &mut dyn embedded_io::Read<Error = Infallible>,
            size: usize,
        ) -> Result<(), StorageError> {
            let mut data = Vec::with_capacity(size);
            let mut buf = [0u8; 64];
            loop {
                let n = read_all(reader, &mut buf);
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            if data.len() != size {
                return FormatSnafu { len: data.len() }.fail();
            }

            std::fs::create_dir_all(&self.dir).context(IoSnafu)?;
            let tmp = self.path(name, ".tmp");
            std::fs::write(&tmp, &data).context(IoSnafu)?;
            let written = std::fs::read(&tmp).context(IoSnafu)?;
            if written != data {
                return FormatSnafu { len: written.len() }.fail();
            }
            verify_image(&written)?;

            let current = self.path(name, "");
            if current.exists() {
                std::fs::rename(&current, self.path(name, ".old")).context(IoSnafu)?;
            }
            std::fs::rename(&tmp, &current).context(IoSnafu)?;
            Ok(())
        }

        fn load(
            &self,
            name: &str,
            f: &mut dyn FnMut(&[u8]) -> Result<(), StorageError>,
        ) -> Result<(), StorageError> {
            let mut corrupt = None;
            for path in [self.path(name, ""), self.path(name, ".old")] {
                match std::fs::read(&path) {
                    Ok(data) if verify_image(&data).is_ok() => return f(&data),
                    Ok(data) => {
                        warn!("Storage image failed its CRC check");
                        corrupt.get_or_insert(data);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e).context(IoSnafu),
                }
            }
            // Neither image is usable, so report the current one
            f(corrupt.as_deref().unwrap_or(&[]))
        }
    }
}
