//! Blob store boundary.
//!
//! The engine consumes object storage only through [`BlobStore`]. Keys are
//! plain `/`-separated strings; listings return full keys, in no guaranteed
//! order (callers sort when order matters).
//!
//! Two backends ship with the crate:
//! - [`MemoryBlobStore`]: in-memory, for tests.
//! - [`FsBlobStore`]: a local directory acting as the bucket (e.g. a mounted
//!   bucket volume).

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::ErrorCode;

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// One entry of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full object key.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
}

impl ObjectEntry {
    /// Last `/`-separated segment of the key.
    #[must_use]
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Errors surfaced by a blob store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Local file I/O failed while staging an upload or download.
    #[error("local I/O error on {}: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The key has `.` or `..` segments and would resolve outside the bucket.
    #[error("object key {0} escapes the bucket root")]
    InvalidKey(String),

    /// The backend itself failed (network, permissions, ...).
    #[error("blob store error on {key}: {message}")]
    Backend { key: String, message: String },
}

impl StoreError {
    pub(crate) fn local(path: &Path, source: io::Error) -> Self {
        Self::Local {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ObjectNotFound,
            Self::Local { .. } => ErrorCode::LocalWriteFailed,
            Self::Backend { .. } => ErrorCode::StoreUnavailable,
            Self::InvalidKey(_) => ErrorCode::InvalidObjectKey,
        }
    }

    /// `true` when the object simply does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Object storage operations the compactor relies on.
pub trait BlobStore: Send + Sync {
    /// List objects whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError>;

    /// Open an object for streaming reads.
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send + '_>, StoreError>;

    /// Create or replace an object with `content`.
    fn put(&self, key: &str, content: &[u8]) -> Result<(), StoreError>;

    /// Upload a local file as `key`.
    fn upload(&self, local: &Path, key: &str) -> Result<(), StoreError>;

    /// Download `key` into a local file, replacing it if present.
    fn download(&self, key: &str, local: &Path) -> Result<(), StoreError>;

    /// Delete one object. Deleting a missing object is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Whether an object exists under exactly `key`.
    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete many objects. Stops at the first failure.
    fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// Read a whole object into memory.
    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut reader = self.get(key)?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| StoreError::Backend {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(buf)
    }
}
