//! Local filesystem helpers for the temp-file-then-promote protocol.
//!
//! Every artifact is first written to a fresh temp file under the cache's
//! scratch directory and only then promoted to its final name, so a crash
//! leaves either the previous artifact or no artifact, never a torn one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// How a finished temp file becomes the real artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Promote {
    /// Atomic `rename(2)` onto the destination.
    #[default]
    Rename,
    /// Copy onto the destination, then delete the temp file. Needed when the
    /// destination sits behind a bind mount that refuses cross-device renames.
    Copy,
}

/// Whether `name` can be used as a single path component without
/// escaping its parent: non-empty, not `.` or `..`, no separators.
#[must_use]
pub fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Create a fresh, exclusively-owned temp file inside `tmp_dir`.
pub fn temp_file(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    fs::create_dir_all(tmp_dir)?;
    tempfile::Builder::new().prefix("tmp.").tempfile_in(tmp_dir)
}

/// Append the full contents of `src` to the temp file.
pub fn append_file(temp: &mut NamedTempFile, src: &Path) -> io::Result<u64> {
    let mut source = File::open(src)?;
    io::copy(&mut source, temp.as_file_mut())
}

/// Flush the temp file and move it to `dest` with the chosen strategy.
pub fn promote(mut temp: NamedTempFile, dest: &Path, strategy: Promote) -> io::Result<()> {
    temp.as_file_mut().flush()?;
    temp.as_file().sync_data()?;

    match strategy {
        Promote::Rename => {
            temp.persist(dest).map_err(|e| e.error)?;
        }
        Promote::Copy => {
            fs::copy(temp.path(), dest)?;
            temp.close()?;
        }
    }
    Ok(())
}

/// Write `content` to `dest` through a temp file in `tmp_dir`.
pub fn write_atomic(
    dest: &Path,
    content: &[u8],
    tmp_dir: &Path,
    strategy: Promote,
) -> io::Result<()> {
    let mut temp = temp_file(tmp_dir)?;
    temp.write_all(content)?;
    promote(temp, dest, strategy)
}

/// Remove a file, treating "already gone" as success.
///
/// Returns `true` if a file was actually removed.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Recursively remove a directory, treating "already gone" as success.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
