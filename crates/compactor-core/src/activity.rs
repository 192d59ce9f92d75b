//! Per-activity incremental merge state.
//!
//! # Artifacts
//!
//! Each merge step produces two content-addressed artifacts named after the
//! fingerprint of the fragment set they cover:
//!
//! - `<sha1>-state.txt`: concatenated raw content of every merged fragment.
//! - `<sha1>-files.txt`: the merged fragment paths, one per line.
//!
//! Both live locally under `<local_root>/<activity>/` and are mirrored to
//! `<remote_root>/<activity>/` in the blob store. The in-memory
//! `current_sha1` only advances once both local artifacts exist; a missing
//! remote mirror is detected later by [`ActivityCompactionState::check_consistency`].

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::epoch;
use crate::config::CompactorConfig;
use crate::diff::set_diff;
use crate::error::ErrorCode;
use crate::fsutil::{self, Promote};
use crate::store::{BlobStore, StoreError};

/// Scratch directory for temp files, inside the local cache root.
pub const TMP_DIR: &str = ".tmp";

/// The two artifacts of a merge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    State,
    Files,
}

impl Artifact {
    const fn suffix(self) -> &'static str {
        match self {
            Self::State => "state.txt",
            Self::Files => "files.txt",
        }
    }

    fn file_name(self, sha1: &str) -> String {
        format!("{sha1}-{}", self.suffix())
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State => f.write_str("state"),
            Self::Files => f.write_str("files-log"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("activity id `{0}` is not usable as a path segment")]
    InvalidId(String),

    #[error("{artifact} artifact {sha1} of activity {activity_id} is missing locally and remotely")]
    ArtifactMissing {
        activity_id: String,
        sha1: String,
        artifact: Artifact,
    },

    #[error("blob store failure for activity {activity_id}: {source}")]
    Store {
        activity_id: String,
        #[source]
        source: StoreError,
    },

    #[error("local I/O failure on {}: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StateError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidId(_) => ErrorCode::InternalUnexpected,
            Self::ArtifactMissing { .. } => ErrorCode::ArtifactMissing,
            Self::Store { source, .. } => source.code(),
            Self::Local { .. } => ErrorCode::LocalWriteFailed,
        }
    }

    fn local(path: &Path, source: io::Error) -> Self {
        Self::Local {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Settings shared by every activity state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateOptions {
    pub local_root: PathBuf,
    pub remote_root: String,
    pub tmp_dir: PathBuf,
    pub promote: Promote,
    pub dry_run: bool,
}

impl StateOptions {
    #[must_use]
    pub fn from_config(config: &CompactorConfig) -> Self {
        let local_root = config.local_state_path.clone();
        Self {
            tmp_dir: local_root.join(TMP_DIR),
            local_root,
            remote_root: config.remote_state_path.trim_end_matches('/').to_string(),
            promote: config.promote,
            dry_run: config.remove_dry_run,
        }
    }
}

/// Blob store plus options, shared by the registry and all of its states.
pub struct StateContext {
    store: Arc<dyn BlobStore>,
    options: StateOptions,
}

impl StateContext {
    pub fn new(store: Arc<dyn BlobStore>, options: StateOptions) -> Arc<Self> {
        Arc::new(Self { store, options })
    }

    #[must_use]
    pub fn options(&self) -> &StateOptions {
        &self.options
    }

    #[must_use]
    pub fn store(&self) -> &dyn BlobStore {
        self.store.as_ref()
    }
}

impl std::fmt::Debug for StateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Outcome of a per-activity garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcOutcome {
    /// Nothing merged yet.
    NeverCompacted,
    /// Local and remote hash sets differ; nothing was deleted.
    Unsynced { local_only: usize, remote_only: usize },
    /// Superseded groups reclaimed (or listed, under dry run).
    Collected {
        hashes: usize,
        local_files: usize,
        remote_files: usize,
    },
}

/// Merge state of a single activity.
#[derive(Debug, Clone)]
pub struct ActivityCompactionState {
    activity_id: String,
    owners: Vec<String>,
    current_sha1: Option<String>,
    /// Fingerprint whose merged content last reached every output.
    distributed_sha1: Option<String>,
    last_update: DateTime<Utc>,
    ctx: Arc<StateContext>,
}

impl ActivityCompactionState {
    /// A never-compacted state. Call [`Self::init`] before use.
    pub fn new(activity_id: impl Into<String>, ctx: Arc<StateContext>) -> Result<Self, StateError> {
        let activity_id = activity_id.into();
        if !fsutil::is_path_segment(&activity_id) {
            return Err(StateError::InvalidId(activity_id));
        }
        Ok(Self {
            activity_id,
            owners: Vec::new(),
            current_sha1: None,
            distributed_sha1: None,
            last_update: epoch(),
            ctx,
        })
    }

    /// Rebuild a state from persisted fields.
    pub fn restore(
        activity_id: impl Into<String>,
        owners: Vec<String>,
        current_sha1: Option<String>,
        distributed_sha1: Option<String>,
        last_update: DateTime<Utc>,
        ctx: Arc<StateContext>,
    ) -> Result<Self, StateError> {
        let mut state = Self::new(activity_id, ctx)?;
        state.owners = owners;
        state.current_sha1 = current_sha1;
        state.distributed_sha1 = distributed_sha1;
        state.last_update = last_update;
        Ok(state)
    }

    /// Ensure the activity's local cache directory exists.
    pub fn init(&self) -> Result<(), StateError> {
        let dir = self.local_dir();
        fs::create_dir_all(&dir).map_err(|e| StateError::local(&dir, e))
    }

    #[must_use]
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    #[must_use]
    pub fn owners(&self) -> &[String] {
        &self.owners
    }

    pub fn set_owners(&mut self, owners: Vec<String>) {
        self.owners = owners;
    }

    #[must_use]
    pub fn current_sha1(&self) -> Option<&str> {
        self.current_sha1.as_deref()
    }

    #[must_use]
    pub fn distributed_sha1(&self) -> Option<&str> {
        self.distributed_sha1.as_deref()
    }

    /// The current merged content has not reached every output yet.
    #[must_use]
    pub fn distribution_pending(&self) -> bool {
        self.current_sha1.is_some() && self.distributed_sha1 != self.current_sha1
    }

    /// Record that the current merged content reached every output.
    pub fn mark_distributed(&mut self) {
        self.distributed_sha1.clone_from(&self.current_sha1);
    }

    #[must_use]
    pub const fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// Local merged-content artifact for the current fingerprint.
    #[must_use]
    pub fn local_state_path(&self) -> Option<PathBuf> {
        self.current_sha1
            .as_deref()
            .map(|sha| self.local_artifact(sha, Artifact::State))
    }

    fn opts(&self) -> &StateOptions {
        &self.ctx.options
    }

    fn store(&self) -> &dyn BlobStore {
        self.ctx.store.as_ref()
    }

    fn local_dir(&self) -> PathBuf {
        self.opts().local_root.join(&self.activity_id)
    }

    fn local_artifact(&self, sha1: &str, artifact: Artifact) -> PathBuf {
        self.local_dir().join(artifact.file_name(sha1))
    }

    fn remote_dir(&self) -> String {
        format!("{}/{}/", self.opts().remote_root, self.activity_id)
    }

    fn remote_artifact(&self, sha1: &str, artifact: Artifact) -> String {
        format!("{}{}", self.remote_dir(), artifact.file_name(sha1))
    }

    fn store_err(&self, source: StoreError) -> StateError {
        StateError::Store {
            activity_id: self.activity_id.clone(),
            source,
        }
    }

    /// Local path of an artifact, pulling it from the remote mirror if the
    /// local copy is gone.
    fn ensure_local(&self, sha1: &str, artifact: Artifact) -> Result<PathBuf, StateError> {
        let local = self.local_artifact(sha1, artifact);
        if local.is_file() {
            return Ok(local);
        }

        let remote = self.remote_artifact(sha1, artifact);
        debug!(activity_id = %self.activity_id, %remote, "pulling artifact from remote mirror");
        self.init()?;
        match self.store().download(&remote, &local) {
            Ok(()) => Ok(local),
            Err(e) if e.is_not_found() => Err(StateError::ArtifactMissing {
                activity_id: self.activity_id.clone(),
                sha1: sha1.to_string(),
                artifact,
            }),
            Err(e) => Err(self.store_err(e)),
        }
    }

    /// Fragment paths merged so far, in merge order.
    pub fn files(&self) -> Result<Vec<String>, StateError> {
        let Some(sha1) = self.current_sha1.as_deref() else {
            return Ok(Vec::new());
        };

        let path = self.ensure_local(sha1, Artifact::Files)?;
        let file = fs::File::open(&path).map_err(|e| StateError::local(&path, e))?;
        let mut files = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StateError::local(&path, e))?;
            if !line.is_empty() {
                files.push(line);
            }
        }
        Ok(files)
    }

    /// Merge `new_paths` on top of the current artifacts under `new_sha1`.
    ///
    /// The whole history is re-materialized under the new name. On error the
    /// state is untouched and the call can be retried.
    pub fn update(
        &mut self,
        new_paths: &[String],
        now: DateTime<Utc>,
        new_sha1: &str,
    ) -> Result<(), StateError> {
        if self.current_sha1.as_deref() == Some(new_sha1) {
            debug!(activity_id = %self.activity_id, sha1 = new_sha1, "fingerprint unchanged, nothing to merge");
            return Ok(());
        }
        self.init()?;
        let opts = self.opts();
        let tmp_dir = opts.tmp_dir.clone();
        let promote = opts.promote;

        // merged content
        let state_dest = self.local_artifact(new_sha1, Artifact::State);
        let mut temp = fsutil::temp_file(&tmp_dir).map_err(|e| StateError::local(&tmp_dir, e))?;
        if let Some(current) = self.current_sha1.as_deref() {
            let prev = self.ensure_local(current, Artifact::State)?;
            fsutil::append_file(&mut temp, &prev).map_err(|e| StateError::local(&prev, e))?;
        }
        for path in new_paths {
            let mut reader = self.store().get(path).map_err(|e| self.store_err(e))?;
            io::copy(&mut reader, temp.as_file_mut()).map_err(|e| {
                self.store_err(StoreError::Backend {
                    key: path.clone(),
                    message: e.to_string(),
                })
            })?;
        }
        fsutil::promote(temp, &state_dest, promote)
            .map_err(|e| StateError::local(&state_dest, e))?;

        // files-log
        let files_dest = self.local_artifact(new_sha1, Artifact::Files);
        let mut temp = fsutil::temp_file(&tmp_dir).map_err(|e| StateError::local(&tmp_dir, e))?;
        if let Some(current) = self.current_sha1.as_deref() {
            let prev = self.ensure_local(current, Artifact::Files)?;
            fsutil::append_file(&mut temp, &prev).map_err(|e| StateError::local(&prev, e))?;
        }
        for path in new_paths {
            writeln!(temp, "{path}").map_err(|e| StateError::local(temp.path(), e))?;
        }
        fsutil::promote(temp, &files_dest, promote)
            .map_err(|e| StateError::local(&files_dest, e))?;

        let previous = self.current_sha1.replace(new_sha1.to_string());
        self.last_update = now;
        info!(
            activity_id = %self.activity_id,
            sha1 = new_sha1,
            previous = previous.as_deref().unwrap_or("-"),
            added = new_paths.len(),
            "merged fragments"
        );

        for artifact in [Artifact::State, Artifact::Files] {
            let local = self.local_artifact(new_sha1, artifact);
            let remote = self.remote_artifact(new_sha1, artifact);
            if let Err(err) = self.store().upload(&local, &remote) {
                warn!(
                    activity_id = %self.activity_id,
                    %remote,
                    error = %err,
                    "remote mirror upload failed; consistency check will flag it"
                );
            }
        }
        Ok(())
    }

    fn local_groups(&self) -> Result<BTreeMap<String, Vec<PathBuf>>, StateError> {
        let dir = self.local_dir();
        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(StateError::local(&dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StateError::local(&dir, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| StateError::local(&entry.path(), e))?
                .is_file();
            if !is_file {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // interrupted download
            if name.starts_with("tmp.") {
                continue;
            }
            let hash = name.split('-').next().unwrap_or_default().to_string();
            groups.entry(hash).or_default().push(entry.path());
        }
        Ok(groups)
    }

    fn remote_groups(&self) -> Result<BTreeMap<String, Vec<String>>, StateError> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let listing = self
            .store()
            .list(&self.remote_dir())
            .map_err(|e| self.store_err(e))?;
        for entry in listing {
            let hash = entry.basename().split('-').next().unwrap_or_default().to_string();
            groups.entry(hash).or_default().push(entry.name);
        }
        Ok(groups)
    }

    /// Delete artifact groups other than the current one, locally and
    /// remotely, provided both sides hold the same set of hashes.
    pub fn garbage_collect(&self) -> Result<GcOutcome, StateError> {
        let Some(current) = self.current_sha1.as_deref() else {
            return Ok(GcOutcome::NeverCompacted);
        };

        let local = self.local_groups()?;
        let remote = self.remote_groups()?;
        let local_hashes: HashSet<String> = local.keys().cloned().collect();
        let remote_hashes: HashSet<String> = remote.keys().cloned().collect();
        let diff = set_diff(&local_hashes, &remote_hashes);
        if !diff.is_empty() {
            warn!(
                activity_id = %self.activity_id,
                local_only = ?diff.removed,
                remote_only = ?diff.added,
                "local and remote artifacts not in sync, skipping garbage collection"
            );
            return Ok(GcOutcome::Unsynced {
                local_only: diff.removed.len(),
                remote_only: diff.added.len(),
            });
        }

        let mut hashes = 0;
        let mut local_files = Vec::new();
        let mut remote_files = Vec::new();
        for (hash, paths) in local {
            if hash == current {
                continue;
            }
            hashes += 1;
            local_files.extend(paths);
            if let Some(keys) = remote.get(&hash) {
                remote_files.extend(keys.iter().cloned());
            }
        }

        let outcome = GcOutcome::Collected {
            hashes,
            local_files: local_files.len(),
            remote_files: remote_files.len(),
        };
        if hashes == 0 {
            return Ok(outcome);
        }
        self.remove_remote(&remote_files)?;
        self.remove_local(&local_files)?;
        Ok(outcome)
    }

    fn remove_remote(&self, keys: &[String]) -> Result<(), StateError> {
        if keys.is_empty() {
            return Ok(());
        }
        if self.opts().dry_run {
            info!(activity_id = %self.activity_id, files = ?keys, "DRY RUN - would remove remote files");
            return Ok(());
        }
        self.store().remove_many(keys).map_err(|e| self.store_err(e))?;
        debug!(activity_id = %self.activity_id, files = ?keys, "removed remote files");
        Ok(())
    }

    fn remove_local(&self, paths: &[PathBuf]) -> Result<(), StateError> {
        for path in paths {
            if self.opts().dry_run {
                info!(activity_id = %self.activity_id, path = %path.display(), "DRY RUN - would remove local file");
                continue;
            }
            fsutil::remove_file_if_exists(path).map_err(|e| StateError::local(path, e))?;
            debug!(activity_id = %self.activity_id, path = %path.display(), "removed local file");
        }
        Ok(())
    }

    /// Whether all four artifacts of the current fingerprint exist.
    ///
    /// A never-compacted state is trivially consistent. Store errors are
    /// returned rather than reported as inconsistency, so a flaky backend
    /// cannot trigger recovery.
    pub fn check_consistency(&self) -> Result<bool, StateError> {
        let Some(sha1) = self.current_sha1.as_deref() else {
            return Ok(true);
        };

        let mut consistent = true;
        for artifact in [Artifact::State, Artifact::Files] {
            let local = self.local_artifact(sha1, artifact);
            if !local.is_file() {
                warn!(activity_id = %self.activity_id, %artifact, path = %local.display(), "local artifact missing");
                consistent = false;
            }
            let remote = self.remote_artifact(sha1, artifact);
            if !self.store().exists(&remote).map_err(|e| self.store_err(e))? {
                warn!(activity_id = %self.activity_id, %artifact, %remote, "remote artifact missing");
                consistent = false;
            }
        }
        Ok(consistent)
    }

    /// Delete every artifact of this activity, locally and remotely.
    pub fn clear(&self) -> Result<(), StateError> {
        let keys: Vec<String> = self
            .store()
            .list(&self.remote_dir())
            .map_err(|e| self.store_err(e))?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        self.remove_remote(&keys)?;

        let dir = self.local_dir();
        if self.opts().dry_run {
            info!(activity_id = %self.activity_id, path = %dir.display(), "DRY RUN - would remove local directory");
            return Ok(());
        }
        fsutil::remove_dir_if_exists(&dir).map_err(|e| StateError::local(&dir, e))?;
        debug!(activity_id = %self.activity_id, path = %dir.display(), "removed local directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::fingerprint;
    use crate::store::MemoryBlobStore;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryBlobStore>,
        ctx: Arc<StateContext>,
    }

    fn fixture(dry_run: bool) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let local_root = dir.path().join("state");
        let store = Arc::new(MemoryBlobStore::new());
        let shared: Arc<dyn BlobStore> = store.clone();
        let ctx = StateContext::new(
            shared,
            StateOptions {
                tmp_dir: local_root.join(TMP_DIR),
                local_root,
                remote_root: "remote".to_string(),
                promote: Promote::Rename,
                dry_run,
            },
        );
        Fixture {
            _dir: dir,
            store,
            ctx,
        }
    }

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| format!("topic/_id=A1/{n}")).collect()
    }

    fn seed(store: &MemoryBlobStore, names: &[&str]) {
        for (name, path) in names.iter().zip(paths(names)) {
            store.insert(path, format!("<{name}>"));
        }
    }

    fn ready(fx: &Fixture) -> ActivityCompactionState {
        let state = ActivityCompactionState::new("A1", Arc::clone(&fx.ctx)).expect("new");
        state.init().expect("init");
        state
    }

    #[test]
    fn rejects_path_like_ids() {
        let fx = fixture(false);
        for bad in ["", "..", "a/b"] {
            assert!(ActivityCompactionState::new(bad, Arc::clone(&fx.ctx)).is_err());
        }
    }

    #[test]
    fn new_state_is_empty_and_consistent() {
        let fx = fixture(false);
        let state = ready(&fx);
        assert!(state.files().expect("files").is_empty());
        assert!(state.check_consistency().expect("check"));
        assert_eq!(state.last_update(), epoch());
        assert_eq!(state.garbage_collect().expect("gc"), GcOutcome::NeverCompacted);
    }

    #[test]
    fn first_update_materializes_both_artifacts() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        let added = paths(&["f1", "f2"]);
        let sha = fingerprint(&added);
        let now = epoch() + Duration::hours(1);

        state.update(&added, now, &sha).expect("update");

        assert_eq!(state.current_sha1(), Some(sha.as_str()));
        assert_eq!(state.last_update(), now);
        let merged = fs::read_to_string(state.local_state_path().expect("path")).expect("read");
        assert_eq!(merged, "<f1><f2>");
        assert_eq!(state.files().expect("files"), added);
        assert!(fx.store.exists(&format!("remote/A1/{sha}-state.txt")).expect("exists"));
        assert!(fx.store.exists(&format!("remote/A1/{sha}-files.txt")).expect("exists"));
        assert!(state.check_consistency().expect("check"));
    }

    #[test]
    fn merge_leaves_distribution_pending_until_marked() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        assert!(!state.distribution_pending());

        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");
        assert!(state.distribution_pending());
        state.mark_distributed();
        assert_eq!(state.distributed_sha1(), Some("s1"));
        assert!(!state.distribution_pending());

        state.update(&paths(&["f2"]), epoch(), "s2").expect("second");
        assert!(state.distribution_pending());
        assert_eq!(state.distributed_sha1(), Some("s1"));
    }

    #[test]
    fn later_update_carries_full_history() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2", "f3"]);
        let mut state = ready(&fx);
        state
            .update(&paths(&["f1", "f2"]), epoch(), "s1")
            .expect("first");
        state.update(&paths(&["f3"]), epoch(), "s2").expect("second");

        let merged = fs::read_to_string(state.local_state_path().expect("path")).expect("read");
        assert_eq!(merged, "<f1><f2><f3>");
        assert_eq!(state.files().expect("files"), paths(&["f1", "f2", "f3"]));
    }

    #[test]
    fn same_fingerprint_is_a_no_op() {
        let fx = fixture(false);
        seed(&fx.store, &["f1"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");
        let reads = fx.store.reads();

        let later = epoch() + Duration::days(1);
        state.update(&paths(&["f1"]), later, "s1").expect("again");
        assert_eq!(state.last_update(), epoch());
        assert_eq!(fx.store.reads(), reads);
    }

    #[test]
    fn failed_fetch_leaves_state_untouched() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");

        fx.store.fail_prefix("topic/_id=A1/f2");
        let err = state
            .update(&paths(&["f2"]), epoch() + Duration::hours(1), "s2")
            .expect_err("fetch fails");
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert_eq!(state.current_sha1(), Some("s1"));
        assert_eq!(state.last_update(), epoch());
        assert!(!fx.ctx.options().local_root.join("A1/s2-state.txt").exists());
        let leftovers = fs::read_dir(&fx.ctx.options().tmp_dir).expect("tmp").count();
        assert_eq!(leftovers, 0);

        fx.store.heal();
        state
            .update(&paths(&["f2"]), epoch() + Duration::hours(1), "s2")
            .expect("retry succeeds");
        assert_eq!(state.files().expect("files"), paths(&["f1", "f2"]));
    }

    #[test]
    fn failed_mirror_upload_still_commits() {
        let fx = fixture(false);
        seed(&fx.store, &["f1"]);
        fx.store.fail_prefix("remote/");
        let mut state = ready(&fx);

        state.update(&paths(&["f1"]), epoch(), "s1").expect("update");
        assert_eq!(state.current_sha1(), Some("s1"));

        fx.store.heal();
        assert!(!state.check_consistency().expect("check"));
    }

    #[test]
    fn files_are_pulled_from_remote_when_local_is_gone() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");
        fs::remove_dir_all(fx.ctx.options().local_root.join("A1")).expect("wipe local");

        assert_eq!(state.files().expect("files"), paths(&["f1"]));
        state.update(&paths(&["f2"]), epoch(), "s2").expect("second");
        let merged = fs::read_to_string(state.local_state_path().expect("path")).expect("read");
        assert_eq!(merged, "<f1><f2>");
    }

    #[test]
    fn files_missing_on_both_sides_is_an_error() {
        let fx = fixture(false);
        let state = ActivityCompactionState::restore(
            "A1",
            vec![],
            Some("gone".to_string()),
            None,
            epoch(),
            Arc::clone(&fx.ctx),
        )
        .expect("restore");
        let err = state.files().expect_err("missing");
        assert_eq!(err.code(), ErrorCode::ArtifactMissing);
        assert!(!state.check_consistency().expect("check"));
    }

    #[test]
    fn gc_keeps_current_group_only() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");
        state.update(&paths(&["f2"]), epoch(), "s2").expect("second");

        let outcome = state.garbage_collect().expect("gc");
        assert_eq!(
            outcome,
            GcOutcome::Collected {
                hashes: 1,
                local_files: 2,
                remote_files: 2
            }
        );
        let local = fx.ctx.options().local_root.join("A1");
        assert!(!local.join("s1-state.txt").exists());
        assert!(local.join("s2-state.txt").exists());
        assert_eq!(
            fx.store.keys(),
            vec![
                "remote/A1/s2-files.txt",
                "remote/A1/s2-state.txt",
                "topic/_id=A1/f1",
                "topic/_id=A1/f2",
            ]
        );
        assert!(state.check_consistency().expect("check"));
    }

    #[test]
    fn gc_skips_when_sides_disagree() {
        let fx = fixture(false);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");
        state.update(&paths(&["f2"]), epoch(), "s2").expect("second");
        fx.store.insert("remote/A1/orphan-state.txt", "x");

        let outcome = state.garbage_collect().expect("gc");
        assert_eq!(
            outcome,
            GcOutcome::Unsynced {
                local_only: 0,
                remote_only: 1
            }
        );
        assert!(fx.ctx.options().local_root.join("A1/s1-state.txt").exists());
        assert!(fx.store.exists("remote/A1/s1-state.txt").expect("exists"));
    }

    #[test]
    fn dry_run_gc_and_clear_delete_nothing() {
        let fx = fixture(true);
        seed(&fx.store, &["f1", "f2"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("first");
        state.update(&paths(&["f2"]), epoch(), "s2").expect("second");

        assert!(matches!(
            state.garbage_collect().expect("gc"),
            GcOutcome::Collected { hashes: 1, .. }
        ));
        state.clear().expect("clear");

        assert!(fx.ctx.options().local_root.join("A1/s1-state.txt").exists());
        assert!(fx.store.exists("remote/A1/s1-files.txt").expect("exists"));
    }

    #[test]
    fn clear_removes_everything_and_is_idempotent() {
        let fx = fixture(false);
        seed(&fx.store, &["f1"]);
        let mut state = ready(&fx);
        state.update(&paths(&["f1"]), epoch(), "s1").expect("update");

        state.clear().expect("clear");
        state.clear().expect("clear again");

        assert!(!fx.ctx.options().local_root.join("A1").exists());
        assert!(fx.store.list("remote/A1/").expect("list").is_empty());
    }
}
