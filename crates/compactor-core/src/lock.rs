//! Advisory lock on the local cache root.
//!
//! Two compactor processes pointed at the same `local_state_path` would race
//! on artifact promotion and on the registry snapshot. The binary takes a
//! [`CacheLock`] for the lifetime of any command that mutates state.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::ErrorCode;

/// File name of the lock inside the cache root.
pub const LOCK_FILE: &str = ".lock";

const RETRY_EVERY: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: cache at {} is locked by another compactor (waited {waited:?})", ErrorCode::LockContention.code(), path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("{}: {0}", ErrorCode::LocalWriteFailed.code())]
    Io(#[from] io::Error),
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io(_) => ErrorCode::LocalWriteFailed,
        }
    }
}

/// Exclusive advisory lock held until dropped.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Lock `<cache_root>/.lock`, polling until `timeout` elapses.
    ///
    /// A zero timeout tries exactly once.
    pub fn acquire(cache_root: &Path, timeout: Duration) -> Result<Self, LockError> {
        fs::create_dir_all(cache_root)?;
        let path = cache_root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let start = Instant::now();
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Self { file, path });
            }
            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(RETRY_EVERY);
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
