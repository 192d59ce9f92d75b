//! Subcommand implementations.
//!
//! Each module exposes an `XArgs` clap struct (when the command takes flags)
//! and a `run_x` entry point returning `anyhow::Result`.

pub mod check;
pub mod completions;
pub mod config;
pub mod consume;
pub mod gc;
pub mod once;
pub mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use compactor_core::clock::SystemClock;
use compactor_core::directory::{ActivityDirectory, StaticDirectory};
use compactor_core::lock::CacheLock;
use compactor_core::store::{BlobStore, FsBlobStore};
use compactor_core::{Compactor, CompactorConfig};
use serde::Serialize;

use crate::directory::HttpDirectory;

/// How long a mutating command waits for another process's cache lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub config: Option<PathBuf>,
    pub activities: Option<PathBuf>,
}

impl Globals {
    pub fn load_config(&self) -> Result<CompactorConfig> {
        CompactorConfig::load(self.config.as_deref())
    }
}

/// A compactor wired to the configured backends. Holds the cache lock
/// until dropped.
pub struct Engine {
    pub compactor: Compactor,
    _lock: CacheLock,
}

pub fn open(globals: &Globals) -> Result<Engine> {
    let config = globals.load_config()?;
    let lock = CacheLock::acquire(&config.local_state_path, LOCK_TIMEOUT).with_context(|| {
        format!(
            "failed to lock state cache {}",
            config.local_state_path.display()
        )
    })?;

    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.store.root.clone()));
    let directory: Arc<dyn ActivityDirectory> = match &globals.activities {
        Some(path) => Arc::new(
            StaticDirectory::from_file(path)
                .with_context(|| format!("failed to load activities from {}", path.display()))?,
        ),
        None => Arc::new(HttpDirectory::from_config(&config.directory)),
    };

    Ok(Engine {
        compactor: Compactor::new(config, store, directory, Arc::new(SystemClock)),
        _lock: lock,
    })
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Left-aligned key/value line for human output.
pub fn print_kv(key: &str, value: impl std::fmt::Display) {
    println!("{:<12} {value}", format!("{key}:"));
}
