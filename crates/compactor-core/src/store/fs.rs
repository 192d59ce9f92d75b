use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{BlobStore, ObjectEntry, StoreError};
use crate::fsutil::{self, Promote};

/// A local directory acting as the bucket.
///
/// Keys are `/`-separated paths relative to `root`. Writes land in a temp
/// file next to the destination and are renamed into place, so readers on
/// the same volume never observe a partial object.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` under the root. Empty segments are skipped; `.` and
    /// `..` are refused so no key reaches outside the root.
    fn path_of(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            if !fsutil::is_path_segment(segment) {
                return Err(StoreError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn staging_dir(&self, dest: &Path) -> Result<PathBuf, StoreError> {
        let parent = dest.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| StoreError::local(&parent, e))?;
        Ok(parent)
    }

    fn write_from(&self, key: &str, mut reader: impl Read) -> Result<(), StoreError> {
        let dest = self.path_of(key)?;
        let dir = self.staging_dir(&dest)?;
        let mut temp = fsutil::temp_file(&dir).map_err(|e| StoreError::local(&dir, e))?;
        io::copy(&mut reader, temp.as_file_mut()).map_err(|e| StoreError::local(&dest, e))?;
        fsutil::promote(temp, &dest, Promote::Rename).map_err(|e| StoreError::local(&dest, e))
    }
}

fn map_open_err(key: &str, path: &Path, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::local(path, err)
    }
}

impl BlobStore for FsBlobStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let (dir_key, name_prefix) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let dir = self.path_of(dir_key)?;

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::local(&dir, e)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::local(&dir, e))?;
            let meta = entry.metadata().map_err(|e| StoreError::local(&entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // in-flight writes from write_from
            if name.starts_with("tmp.") || !name.starts_with(name_prefix) {
                continue;
            }
            let key = if dir_key.is_empty() {
                name
            } else {
                format!("{dir_key}/{name}")
            };
            out.push(ObjectEntry {
                name: key,
                size: meta.len(),
            });
        }
        debug!(prefix, count = out.len(), "listed objects");
        Ok(out)
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send + '_>, StoreError> {
        let path = self.path_of(key)?;
        let file = File::open(&path).map_err(|e| map_open_err(key, &path, e))?;
        Ok(Box::new(file))
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<(), StoreError> {
        self.write_from(key, content)
    }

    fn upload(&self, local: &Path, key: &str) -> Result<(), StoreError> {
        let file = File::open(local).map_err(|e| StoreError::local(local, e))?;
        self.write_from(key, file)
    }

    fn download(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        let src = self.path_of(key)?;
        let mut source = File::open(&src).map_err(|e| map_open_err(key, &src, e))?;
        let dir = local
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = fsutil::temp_file(dir).map_err(|e| StoreError::local(dir, e))?;
        io::copy(&mut source, temp.as_file_mut()).map_err(|e| StoreError::local(local, e))?;
        fsutil::promote(temp, local, Promote::Rename).map_err(|e| StoreError::local(local, e))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_of(key)?;
        fsutil::remove_file_if_exists(&path)
            .map(|_| ())
            .map_err(|e| StoreError::local(&path, e))
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_of(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::local(&path, e)),
        }
    }
}
