//! `ConfigStore` implementations: an in-memory slot and a single file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use mppt_traits::{BoxError, ConfigStore};

use crate::atomic::write_atomic;

#[derive(Debug, Default)]
struct MemoryInner {
    image: Option<Vec<u8>>,
    writes: usize,
}

/// Shared in-memory store. Clones see the same image, which lets a test keep a
/// handle after the controller has taken ownership of the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(image: Vec<u8>) -> Self {
        let s = Self::new();
        s.lock().image = Some(image);
        s
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn image(&self) -> Option<Vec<u8>> {
        self.lock().image.clone()
    }

    /// Number of successful `persist` calls.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Flip one bit of the stored image, if any.
    pub fn corrupt(&self, byte: usize) {
        if let Some(b) = self.lock().image.as_mut().and_then(|img| img.get_mut(byte)) {
            *b ^= 0x01;
        }
    }
}

impl ConfigStore for MemoryStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, BoxError> {
        Ok(self.image())
    }

    fn persist(&mut self, image: &[u8]) -> Result<(), BoxError> {
        let mut g = self.lock();
        g.image = Some(image.to_vec());
        g.writes += 1;
        Ok(())
    }
}

/// Persisted image in a single file. A missing file reads as an empty store.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Result<Option<Vec<u8>>, BoxError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn persist(&mut self, image: &[u8]) -> Result<(), BoxError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        write_atomic(&self.path, image)?;
        Ok(())
    }
}
