use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use super::{BlobStore, ObjectEntry, StoreError};

/// In-memory blob store for tests.
///
/// Counts object reads so tests can assert that a no-op sweep did no merge
/// I/O, and can be told to fail every operation on keys under a prefix.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    failing: RwLock<Vec<String>>,
    reads: AtomicUsize,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object.
    pub fn insert(&self, key: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), content.into());
    }

    /// Snapshot of an object's bytes, if present.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// All keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Number of `get` calls served so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Make every operation on keys starting with `prefix` fail.
    pub fn fail_prefix(&self, prefix: impl Into<String>) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prefix.into());
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        let failing = self.failing.read().unwrap_or_else(PoisonError::into_inner);
        if failing.iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StoreError::Backend {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        self.check(prefix)?;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(name, data)| ObjectEntry {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send + '_>, StoreError> {
        self.check(key)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self
            .object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<(), StoreError> {
        self.check(key)?;
        self.insert(key, content);
        Ok(())
    }

    fn upload(&self, local: &Path, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        let data = std::fs::read(local).map_err(|e| StoreError::local(local, e))?;
        self.insert(key, data);
        Ok(())
    }

    fn download(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        self.check(key)?;
        let data = self
            .object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        std::fs::write(local, data).map_err(|e| StoreError::local(local, e))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check(key)?;
        Ok(self.object(key).is_some())
    }
}
