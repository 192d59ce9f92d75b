//! Registry of activity states and its persisted snapshot.
//!
//! The snapshot (`state.json`) holds only the scalar fields of each state;
//! artifacts are never embedded. It is written locally first, through the
//! temp-then-promote protocol, and then mirrored to
//! `<remote_root>/state.json`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::activity::{ActivityCompactionState, GcOutcome, StateContext, StateError};
use crate::clock::{Clock, elapsed, epoch, format_duration, millis};
use crate::error::ErrorCode;
use crate::fsutil;
use crate::store::StoreError;

/// File name of the aggregate snapshot, locally and remotely.
pub const SNAPSHOT_FILE: &str = "state.json";

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("snapshot {origin} could not be decoded: {message}")]
    Corrupt { origin: String, message: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("snapshot mirror failed: {0}")]
    Store(#[from] StoreError),

    #[error("snapshot write failed: {0}")]
    Local(#[from] std::io::Error),
}

impl RegistryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Corrupt { .. } => ErrorCode::SnapshotCorrupt,
            Self::State(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::Local(_) => ErrorCode::LocalWriteFailed,
        }
    }
}

/// Persisted fields of one activity state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_id: String,
    pub last_update: DateTime<Utc>,
    pub current_sha1: Option<String>,
    /// Fingerprint last copied to every output. Lags `current_sha1` when a
    /// distribution failed; the next sweep retries it.
    #[serde(default)]
    pub distributed_sha1: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
}

/// Versioned aggregate snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub last_gc: Option<DateTime<Utc>>,
    pub states: std::collections::BTreeMap<String, ActivityRecord>,
}

impl Snapshot {
    /// Decode either the versioned schema or the older tagged format.
    pub fn decode(content: &str, origin: &str) -> Result<Self, RegistryError> {
        let corrupt = |message: String| RegistryError::Corrupt {
            origin: origin.to_string(),
            message,
        };
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| corrupt(e.to_string()))?;

        if value.get("version").is_some() {
            let snapshot: Self =
                serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
            if snapshot.version > SNAPSHOT_VERSION {
                return Err(corrupt(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            return Ok(snapshot);
        }

        let legacy: legacy::Snapshot =
            serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        info!(origin, "migrating legacy snapshot format");
        Ok(legacy.into())
    }

    pub fn encode(&self) -> Result<String, RegistryError> {
        serde_json::to_string_pretty(self).map_err(|e| RegistryError::Corrupt {
            origin: "in-memory".to_string(),
            message: e.to_string(),
        })
    }
}

/// The tagged `{"dataType": ..., "value": ...}` snapshot layout written by
/// earlier deployments.
mod legacy {
    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    use super::{ActivityRecord, SNAPSHOT_VERSION};

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Snapshot {
        #[serde(rename = "lastGC", default)]
        last_gc: Option<DateTime<Utc>>,
        states: Tagged<Vec<(String, Tagged<Record>)>>,
    }

    #[derive(Deserialize)]
    struct Tagged<T> {
        #[serde(rename = "dataType")]
        _data_type: String,
        value: T,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Record {
        activity_id: String,
        last_update: DateTime<Utc>,
        current_sha1: Option<String>,
        #[serde(default)]
        owners: Vec<String>,
    }

    impl From<Snapshot> for super::Snapshot {
        fn from(old: Snapshot) -> Self {
            let states = old
                .states
                .value
                .into_iter()
                .map(|(id, tagged)| {
                    let r = tagged.value;
                    (
                        id,
                        ActivityRecord {
                            activity_id: r.activity_id,
                            last_update: r.last_update,
                            distributed_sha1: r.current_sha1.clone(),
                            current_sha1: r.current_sha1,
                            owners: r.owners,
                        },
                    )
                })
                .collect();
            Self {
                version: SNAPSHOT_VERSION,
                last_gc: old.last_gc,
                states,
            }
        }
    }
}

/// Where a loaded registry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Local,
    Remote,
    Empty,
}

/// Summary of a registry-wide GC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub ran: bool,
    pub collected: usize,
    pub unsynced: usize,
    pub failed: usize,
}

/// Map of activity id to merge state, plus the GC schedule.
pub struct CompactorRegistry {
    ctx: Arc<StateContext>,
    clock: Arc<dyn Clock>,
    gc_interval: chrono::Duration,
    last_gc: Option<DateTime<Utc>>,
    states: HashMap<String, ActivityCompactionState>,
}

impl std::fmt::Debug for CompactorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactorRegistry")
            .field("gc_interval", &self.gc_interval)
            .field("last_gc", &self.last_gc)
            .field("states", &self.states.len())
            .finish_non_exhaustive()
    }
}

impl CompactorRegistry {
    /// An empty registry.
    pub fn new(ctx: Arc<StateContext>, clock: Arc<dyn Clock>, gc_interval_ms: u64) -> Self {
        Self {
            ctx,
            clock,
            gc_interval: millis(gc_interval_ms),
            last_gc: None,
            states: HashMap::new(),
        }
    }

    /// Load the snapshot from local disk, else from the remote mirror, else
    /// start empty.
    ///
    /// A snapshot that exists but cannot be decoded is an error; silently
    /// starting empty would orphan every artifact it references.
    pub fn load(
        ctx: Arc<StateContext>,
        clock: Arc<dyn Clock>,
        gc_interval_ms: u64,
    ) -> Result<(Self, LoadSource), RegistryError> {
        let mut registry = Self::new(ctx, clock, gc_interval_ms);
        let source = registry.init()?;
        Ok((registry, source))
    }

    /// Replace in-memory contents with the persisted snapshot, if any.
    pub fn init(&mut self) -> Result<LoadSource, RegistryError> {
        let local = self.local_path();
        match std::fs::read_to_string(&local) {
            Ok(content) => {
                self.apply(Snapshot::decode(&content, &local.display().to_string())?);
                debug!(path = %local.display(), states = self.size(), "loaded local snapshot");
                return Ok(LoadSource::Local);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RegistryError::Local(e)),
        }

        let remote = self.remote_key();
        match self.ctx.store().get_bytes(&remote) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                self.apply(Snapshot::decode(&content, &remote)?);
                info!(key = %remote, states = self.size(), "loaded snapshot from remote mirror");
                Ok(LoadSource::Remote)
            }
            Err(e) if e.is_not_found() => {
                warn!("no snapshot found locally or remotely, starting empty (first run?)");
                self.last_gc = None;
                self.states.clear();
                Ok(LoadSource::Empty)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn apply(&mut self, snapshot: Snapshot) {
        self.last_gc = snapshot.last_gc;
        self.states.clear();
        for (id, record) in snapshot.states {
            if id != record.activity_id {
                warn!(key = %id, activity_id = %record.activity_id, "snapshot key and activity id differ, using key");
            }
            let state = ActivityCompactionState::restore(
                id.clone(),
                record.owners,
                record.current_sha1,
                record.distributed_sha1,
                record.last_update,
                Arc::clone(&self.ctx),
            )
            .and_then(|state| state.init().map(|()| state));
            match state {
                Ok(state) => {
                    self.states.insert(id, state);
                }
                Err(err) => {
                    warn!(activity_id = %id, error = %err, "failed to initialize activity state, skipping");
                }
            }
        }
    }

    fn local_path(&self) -> std::path::PathBuf {
        self.ctx.options().local_root.join(SNAPSHOT_FILE)
    }

    fn remote_key(&self) -> String {
        format!("{}/{SNAPSHOT_FILE}", self.ctx.options().remote_root)
    }

    /// Register a fresh state for `activity_id`, replacing any previous one.
    pub fn create(
        &mut self,
        activity_id: &str,
    ) -> Result<&mut ActivityCompactionState, RegistryError> {
        let state = ActivityCompactionState::new(activity_id, Arc::clone(&self.ctx))?;
        state.init()?;
        info!(activity_id, "new activity");
        let slot = match self.states.entry(activity_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(state);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(state),
        };
        Ok(slot)
    }

    /// Purge an activity's artifacts and forget it.
    ///
    /// Returns `true` if the activity was removed. Under dry run nothing is
    /// touched and `false` is returned.
    pub fn remove(&mut self, activity_id: &str) -> Result<bool, RegistryError> {
        let Some(state) = self.states.get(activity_id) else {
            return Ok(false);
        };
        if self.ctx.options().dry_run {
            info!(activity_id, "DRY RUN - would remove known activity");
            return Ok(false);
        }
        state.clear()?;
        self.states.remove(activity_id);
        info!(activity_id, "known activity removed");
        Ok(true)
    }

    /// Run every state's GC if the interval since the last run has passed.
    pub fn garbage_collect(&mut self) -> GcReport {
        self.garbage_collect_with(false)
    }

    /// Like [`Self::garbage_collect`]; `force` ignores the interval.
    pub fn garbage_collect_with(&mut self, force: bool) -> GcReport {
        let started = self.clock.now();
        let since = elapsed(self.last_gc.unwrap_or_else(epoch), started);
        if !force && since < self.gc_interval {
            debug!(since = %format_duration(since), "garbage collection not due");
            return GcReport::default();
        }

        debug!("garbage collection started");
        let mut report = GcReport {
            ran: true,
            ..GcReport::default()
        };
        let mut ids: Vec<&String> = self.states.keys().collect();
        ids.sort();
        for id in ids {
            match self.states[id].garbage_collect() {
                Ok(GcOutcome::Collected { hashes, .. }) => report.collected += hashes,
                Ok(GcOutcome::Unsynced { .. }) => report.unsynced += 1,
                Ok(GcOutcome::NeverCompacted) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(activity_id = %id, error = %err, code = err.code().code(), "garbage collection failed");
                }
            }
        }

        let finished = self.clock.now();
        info!(
            took = %format_duration(elapsed(started, finished)),
            collected = report.collected,
            unsynced = report.unsynced,
            failed = report.failed,
            "garbage collection finished"
        );
        self.last_gc = Some(finished);
        report
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            last_gc: self.last_gc,
            states: self
                .states
                .iter()
                .map(|(id, state)| {
                    (
                        id.clone(),
                        ActivityRecord {
                            activity_id: state.activity_id().to_string(),
                            last_update: state.last_update(),
                            current_sha1: state.current_sha1().map(String::from),
                            distributed_sha1: state.distributed_sha1().map(String::from),
                            owners: state.owners().to_vec(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Write the snapshot locally, then mirror it remotely.
    pub fn save(&self) -> Result<(), RegistryError> {
        let content = self.snapshot().encode()?;
        let opts = self.ctx.options();
        std::fs::create_dir_all(&opts.local_root)?;
        fsutil::write_atomic(&self.local_path(), content.as_bytes(), &opts.tmp_dir, opts.promote)?;
        self.ctx.store().put(&self.remote_key(), content.as_bytes())?;
        debug!(states = self.size(), "registry snapshot saved");
        Ok(())
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn get(&self, activity_id: &str) -> Option<&ActivityCompactionState> {
        self.states.get(activity_id)
    }

    pub fn get_mut(&mut self, activity_id: &str) -> Option<&mut ActivityCompactionState> {
        self.states.get_mut(activity_id)
    }

    /// Known activity ids, sorted.
    #[must_use]
    pub fn known_activities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub const fn last_gc(&self) -> Option<DateTime<Utc>> {
        self.last_gc
    }

    #[must_use]
    pub fn context(&self) -> &Arc<StateContext> {
        &self.ctx
    }
}
