//! A storage backend keeping images in memory
use std::{collections::BTreeMap, convert::Infallible, sync::Mutex};

use canode_node::storage::{StorageBackend, StorageError};

/// Keeps the images in memory, so that a test can inspect and tamper with them
#[derive(Default)]
pub struct MemoryStorage {
    images: Mutex<BTreeMap<String, Vec<u8>>>,
    stores: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub const fn new() -> Self {
        Self {
            images: Mutex::new(BTreeMap::new()),
            stores: Mutex::new(Vec::new()),
        }
    }

    /// The stored image `name`
    pub fn image(&self, name: &str) -> Option<Vec<u8>> {
        self.images.lock().unwrap().get(name).cloned()
    }

    /// Flip the bits of one byte of a stored image
    pub fn corrupt(&self, name: &str, pos: usize) {
        let mut images = self.images.lock().unwrap();
        let image = images.get_mut(name).expect("image not stored");
        image[pos] ^= 0xFF;
    }

    /// Names of the images stored since the last call
    pub fn take_stores(&self) -> Vec<String> {
        std::mem::take(&mut *self.stores.lock().unwrap())
    }

    pub fn clear(&self) {
        self.images.lock().unwrap().clear();
        self.stores.lock().unwrap().clear();
    }
}

impl StorageBackend for MemoryStorage {
    fn store(
        &self,
        name: &str,
        reader: &mut dyn embedded_io::Read<Error = Infallible>,
        size: usize,
    ) -> Result<(), StorageError> {
        let mut image = vec![0; size];
        let mut pos = 0;
        while pos < size {
            let n = match reader.read(&mut image[pos..]) {
                Ok(n) => n,
                Err(never) => match never {},
            };
            if n == 0 {
                return Err(StorageError::Format { len: pos });
            }
            pos += n;
        }
        self.images.lock().unwrap().insert(name.to_string(), image);
        self.stores.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn load(
        &self,
        name: &str,
        f: &mut dyn FnMut(&[u8]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let images = self.images.lock().unwrap();
        f(images.get(name).map(Vec::as_slice).unwrap_or(&[]))
    }
}
