//! compactor-core library.
//!
//! Incremental compaction of append-only trace fragments: per-activity merge
//! state ([`activity`]), the registry and its snapshot ([`registry`]), and
//! sweep orchestration ([`compactor`]), over the [`store`], [`directory`]
//! and [`feed`] boundaries.

pub mod activity;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod diff;
pub mod directory;
pub mod error;
pub mod feed;
pub mod fsutil;
pub mod lock;
pub mod registry;
pub mod store;

/// # Conventions
///
/// - **Errors**: one `thiserror` enum per boundary, each with `code()`
///   mapping to [`error::ErrorCode`]; `anyhow::Result` at config edges.
/// - **Logging**: `tracing` macros with structured fields
///   (`activity_id = %id`, `sha1 = %sha`).
/// - **Time**: read only through [`clock::Clock`].
pub use activity::{ActivityCompactionState, StateContext, StateOptions};
pub use compactor::{Compactor, ShutdownHandle, StatusHandle, SweepOutcome, SweepReport};
pub use config::CompactorConfig;
pub use registry::CompactorRegistry;
