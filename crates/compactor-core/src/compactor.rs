//! Sweep orchestration.
//!
//! [`Compactor::compact`] runs one polling sweep: consistency pass, removal
//! of activities the directory no longer reports, registry GC, then the
//! per-activity owner reconcile, fingerprint check, batching gate, merge and
//! distribution. [`Compactor::consume`] feeds single fragments from an event
//! feed through the same merge-and-distribute routine.
//!
//! At most one sweep runs at a time; a second request while one is in
//! flight is rejected, not queued.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityCompactionState, StateContext, StateError, StateOptions};
use crate::clock::{Clock, elapsed, format_duration, millis};
use crate::config::{CompactorConfig, OutputMode};
use crate::diff::{fingerprint, ordered_diff};
use crate::directory::{Activity, ActivityDirectory, ActivityFilter, DirectoryError};
use crate::error::ErrorCode;
use crate::feed::{EventFeed, FeedError, FeedRecord, FragmentKey, KeyError};
use crate::fsutil;
use crate::registry::{CompactorRegistry, GcReport, RegistryError};
use crate::store::{BlobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("a compaction sweep is already running")]
    InProgress,
}

impl CompactError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Directory(e) => e.code(),
            Self::Registry(e) => e.code(),
            Self::State(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::Key(e) => e.code(),
            Self::Feed(e) => e.code(),
            Self::InProgress => ErrorCode::SweepInProgress,
        }
    }
}

/// Counters for one polling sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Activities returned by the directory.
    pub activities: usize,
    /// States created for first-seen activities.
    pub created: usize,
    pub compacted: usize,
    /// New fragments held back by the batching gate.
    pub postponed: usize,
    /// Fingerprint unchanged.
    pub unchanged: usize,
    /// Fingerprint unchanged but the last distribution had failed; outputs
    /// were copied again.
    pub redistributed: usize,
    pub failed: usize,
    /// Known activities dropped because the directory no longer lists them.
    pub removed: usize,
    /// Activities forgotten by the consistency pass.
    pub recovered: usize,
    /// The sweep stopped early on shutdown.
    pub interrupted: bool,
}

/// Result of [`Compactor::compact`].
#[derive(Debug)]
pub enum SweepOutcome {
    Completed(SweepReport),
    AlreadyRunning,
    Failed(CompactError),
}

/// What happened to one activity in the compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Unchanged,
    Postponed,
    Compacted,
    Redistributed,
}

/// Consistency findings for one activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityCheck {
    pub activity_id: String,
    pub current_sha1: Option<String>,
    /// All four artifacts of the current fingerprint exist.
    pub artifacts_ok: bool,
    /// Distributed outputs that should exist but do not.
    pub missing_outputs: Vec<String>,
}

impl ActivityCheck {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.artifacts_ok && self.missing_outputs.is_empty()
    }
}

/// Result of [`Compactor::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub checks: Vec<ActivityCheck>,
    /// Activities whose check itself failed (store errors).
    pub errors: Vec<String>,
    /// Activities forgotten because `recover` was set.
    pub recovered: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn inconsistent(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| !c.is_consistent())
            .map(|c| c.activity_id.as_str())
            .collect()
    }
}

/// What happened to one event-feed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Merged,
    /// Fragment already merged; redelivery.
    Duplicate,
}

/// Counters for an event-feed consumption run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeReport {
    pub records: usize,
    pub merged: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct StatusInner {
    processing: AtomicBool,
    current: AtomicI64,
    total: AtomicI64,
    start_time: Mutex<Option<DateTime<Utc>>>,
}

/// Sweep progress, readable from any thread without blocking the sweep.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<StatusInner>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                processing: AtomicBool::new(false),
                current: AtomicI64::new(-1),
                total: AtomicI64::new(-1),
                start_time: Mutex::new(None),
            }),
        }
    }
}

fn as_index(raw: i64) -> Option<usize> {
    usize::try_from(raw).ok()
}

impl StatusHandle {
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Index of the activity being processed.
    #[must_use]
    pub fn current(&self) -> Option<usize> {
        as_index(self.inner.current.load(Ordering::Relaxed))
    }

    /// Number of activities in the running sweep.
    #[must_use]
    pub fn total(&self) -> Option<usize> {
        as_index(self.inner.total.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// ISO-8601 time since the last sweep started, `PT0S` if none has.
    #[must_use]
    pub fn elapsed_time(&self, now: DateTime<Utc>) -> String {
        self.start_time()
            .map_or_else(|| "PT0S".to_string(), |start| format_duration(elapsed(start, now)))
    }

    pub(crate) fn try_begin(&self, now: DateTime<Utc>) -> Option<SweepGuard> {
        self.inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self
            .inner
            .start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.inner.current.store(-1, Ordering::Relaxed);
        self.inner.total.store(-1, Ordering::Relaxed);
        Some(SweepGuard {
            status: self.clone(),
        })
    }

    fn set_total(&self, total: usize) {
        self.inner
            .total
            .store(i64::try_from(total).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    fn set_current(&self, current: usize) {
        self.inner
            .current
            .store(i64::try_from(current).unwrap_or(i64::MAX), Ordering::Relaxed);
    }
}

/// Clears the processing flag when dropped, however the sweep ends.
pub(crate) struct SweepGuard {
    status: StatusHandle,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.status
            .inner
            .processing
            .store(false, Ordering::Release);
    }
}

/// Cooperative stop flag, checked once per activity.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The compaction engine.
pub struct Compactor {
    config: CompactorConfig,
    ctx: Arc<StateContext>,
    directory: Arc<dyn ActivityDirectory>,
    clock: Arc<dyn Clock>,
    status: StatusHandle,
    shutdown: ShutdownHandle,
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("ctx", &self.ctx)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Compactor {
    pub fn new(
        config: CompactorConfig,
        store: Arc<dyn BlobStore>,
        directory: Arc<dyn ActivityDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ctx = StateContext::new(store, StateOptions::from_config(&config));
        Self {
            config,
            ctx,
            directory,
            clock,
            status: StatusHandle::default(),
            shutdown: ShutdownHandle::default(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    #[must_use]
    pub const fn config(&self) -> &CompactorConfig {
        &self.config
    }

    fn store(&self) -> &dyn BlobStore {
        self.ctx.store()
    }

    /// Load the registry snapshot (local, then remote, then empty).
    pub fn load_registry(&self) -> Result<CompactorRegistry, CompactError> {
        let (registry, source) = CompactorRegistry::load(
            Arc::clone(&self.ctx),
            Arc::clone(&self.clock),
            self.config.gc_interval_ms,
        )?;
        debug!(?source, states = registry.size(), "registry loaded");
        Ok(registry)
    }

    fn fetch_activities(&self) -> Result<Vec<Activity>, CompactError> {
        let filter = ActivityFilter::of_types(&self.config.activity_types);
        Ok(self.directory.activities(&filter)?)
    }

    /// Run one polling sweep unless one is already in flight.
    pub fn compact(&self) -> SweepOutcome {
        let started = self.clock.now();
        let Some(_guard) = self.status.try_begin(started) else {
            info!(
                elapsed = %self.status.elapsed_time(self.clock.now()),
                "compaction still running"
            );
            return SweepOutcome::AlreadyRunning;
        };

        info!("start compaction");
        match self.sweep() {
            Ok(report) => {
                info!(
                    took = %format_duration(elapsed(started, self.clock.now())),
                    activities = report.activities,
                    compacted = report.compacted,
                    redistributed = report.redistributed,
                    postponed = report.postponed,
                    failed = report.failed,
                    "end of compaction"
                );
                SweepOutcome::Completed(report)
            }
            Err(err) => {
                error!(error = %err, code = err.code().code(), "compaction sweep failed");
                SweepOutcome::Failed(err)
            }
        }
    }

    fn sweep(&self) -> Result<SweepReport, CompactError> {
        let mut registry = self.load_registry()?;
        let activities = self.fetch_activities()?;
        let mut report = SweepReport {
            activities: activities.len(),
            ..SweepReport::default()
        };
        info!(
            known = registry.size(),
            received = activities.len(),
            "activities fetched"
        );

        if registry.size() > 0 {
            report.recovered = self.consistency_pass(&mut registry, &activities);
        }

        let listed: HashSet<&str> = activities.iter().map(|a| a.id.as_str()).collect();
        for id in registry.known_activities() {
            if listed.contains(id.as_str()) {
                continue;
            }
            match registry.remove(&id) {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(err) => warn!(activity_id = %id, error = %err, "failed to remove activity"),
            }
        }
        registry.garbage_collect();

        self.status.set_total(activities.len());
        for (idx, activity) in activities.iter().enumerate() {
            if self.shutdown.is_requested() {
                info!(processed = idx, "shutdown requested, stopping sweep");
                report.interrupted = true;
                break;
            }
            self.status.set_current(idx);
            debug!(activity_id = %activity.id, "processing activity");

            match self.process_activity(&mut registry, activity, &mut report) {
                Ok(Step::Compacted) => report.compacted += 1,
                Ok(Step::Postponed) => report.postponed += 1,
                Ok(Step::Unchanged) => report.unchanged += 1,
                Ok(Step::Redistributed) => report.redistributed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        activity_id = %activity.id,
                        error = %err,
                        code = err.code().code(),
                        "activity compaction failed, will retry next sweep"
                    );
                }
            }

            if (idx + 1) % self.config.save_every.max(1) == 0 {
                if let Err(err) = registry.save() {
                    warn!(error = %err, "mid-sweep snapshot save failed");
                }
            }
        }
        registry.save()?;
        Ok(report)
    }

    /// Check every known activity still listed; forget failures when
    /// recovery is on. Returns how many were forgotten.
    fn consistency_pass(&self, registry: &mut CompactorRegistry, activities: &[Activity]) -> usize {
        let mut failed = Vec::new();
        for activity in activities {
            let Some(state) = registry.get(&activity.id) else {
                continue;
            };
            match self.check_activity(state) {
                Ok(check) if !check.is_consistent() => failed.push(activity.id.clone()),
                Ok(_) => {}
                Err(err) => {
                    warn!(activity_id = %activity.id, error = %err, "consistency check could not complete");
                }
            }
        }
        if failed.is_empty() {
            return 0;
        }
        if !self.config.recovery {
            warn!(activities = ?failed, "inconsistent activities found, recovery disabled");
            return 0;
        }

        let mut recovered = 0;
        for id in &failed {
            info!(activity_id = %id, "recovering inconsistent activity");
            match registry.remove(id) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => warn!(activity_id = %id, error = %err, "recovery failed"),
            }
        }
        recovered
    }

    fn output_paths(&self, state: &ActivityCompactionState) -> Vec<String> {
        let layout = &self.config.store;
        match self.config.output {
            OutputMode::Owners => state
                .owners()
                .iter()
                .map(|owner| layout.owner_output_path(owner, state.activity_id()))
                .collect(),
            OutputMode::Shared => vec![layout.shared_output_path(state.activity_id())],
        }
    }

    /// Outputs for a fragment merged from the event feed: always the shared
    /// per-activity artifact, plus the owners' copies in owner mode. A state
    /// first seen on the feed has no owners until a sweep reconciles them.
    fn event_output_paths(&self, state: &ActivityCompactionState) -> Vec<String> {
        let mut paths = vec![self.config.store.shared_output_path(state.activity_id())];
        if self.config.output == OutputMode::Owners {
            paths.extend(self.output_paths(state));
        }
        paths
    }

    fn check_activity(&self, state: &ActivityCompactionState) -> Result<ActivityCheck, CompactError> {
        let artifacts_ok = state.check_consistency()?;
        let mut missing_outputs = Vec::new();
        if state.current_sha1().is_some() {
            for path in self.output_paths(state) {
                if !self.store().exists(&path)? {
                    warn!(activity_id = %state.activity_id(), %path, "distributed output missing");
                    missing_outputs.push(path);
                }
            }
        }
        Ok(ActivityCheck {
            activity_id: state.activity_id().to_string(),
            current_sha1: state.current_sha1().map(String::from),
            artifacts_ok,
            missing_outputs,
        })
    }

    fn process_activity(
        &self,
        registry: &mut CompactorRegistry,
        activity: &Activity,
        report: &mut SweepReport,
    ) -> Result<Step, CompactError> {
        if registry.get(&activity.id).is_none() {
            registry.create(&activity.id)?;
            report.created += 1;
        }
        let state = registry
            .get_mut(&activity.id)
            .ok_or_else(|| StateError::InvalidId(activity.id.clone()))?;

        self.reconcile_owners(state, activity)?;
        self.compact_activity(state)
    }

    fn reconcile_owners(
        &self,
        state: &mut ActivityCompactionState,
        activity: &Activity,
    ) -> Result<(), CompactError> {
        let mut previous = state.owners().to_vec();
        previous.sort();
        let diff = ordered_diff(&previous, &activity.sorted_owners());
        if diff.is_empty() {
            return Ok(());
        }

        if !diff.removed.is_empty() {
            info!(activity_id = %activity.id, removed = ?diff.removed, "removing owners");
            for owner in &diff.removed {
                self.remove_owner_output(owner, &activity.id)?;
            }
        }
        let mut owners: Vec<String> = state
            .owners()
            .iter()
            .filter(|owner| !diff.removed.contains(*owner))
            .cloned()
            .collect();
        owners.extend(diff.added);
        state.set_owners(owners);
        Ok(())
    }

    fn remove_owner_output(&self, owner: &str, activity_id: &str) -> Result<(), CompactError> {
        if self.config.output == OutputMode::Shared {
            return Ok(());
        }
        if !fsutil::is_path_segment(owner) {
            warn!(activity_id, owner, "owner name never had an output, nothing to remove");
            return Ok(());
        }
        let path = self.config.store.owner_output_path(owner, activity_id);
        if self.config.remove_dry_run {
            info!(activity_id, owner, %path, "DRY RUN - would remove owner output");
            return Ok(());
        }
        self.store().remove(&path)?;
        debug!(activity_id, owner, %path, "removed owner output");
        Ok(())
    }

    fn compact_activity(&self, state: &mut ActivityCompactionState) -> Result<Step, CompactError> {
        let prefix = self.config.store.traces_prefix(state.activity_id());
        let mut listing: Vec<String> = self
            .store()
            .list(&prefix)?
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        listing.sort();
        let sha1 = fingerprint(&listing);
        if state.current_sha1() == Some(sha1.as_str()) {
            if !state.distribution_pending() {
                debug!(activity_id = %state.activity_id(), "nothing to do");
                return Ok(Step::Unchanged);
            }
            info!(
                activity_id = %state.activity_id(),
                sha1 = %sha1,
                distributed = state.distributed_sha1().unwrap_or("-"),
                "redistributing compacted traces"
            );
            let outputs = self.output_paths(state);
            self.distribute(state, &outputs)?;
            return Ok(Step::Redistributed);
        }

        let mut recorded = state.files()?;
        recorded.sort();
        let added = ordered_diff(&recorded, &listing).added;

        let now = self.clock.now();
        let since = elapsed(state.last_update(), now);
        if added.len() < self.config.batch_size && since < millis(self.config.max_delay_ms) {
            debug!(
                activity_id = %state.activity_id(),
                pending = added.len(),
                elapsed = %format_duration(since),
                "update postponed"
            );
            return Ok(Step::Postponed);
        }

        info!(activity_id = %state.activity_id(), added = added.len(), "compacting activity");
        state.update(&added, now, &sha1)?;
        let outputs = self.output_paths(state);
        self.distribute(state, &outputs)?;
        Ok(Step::Compacted)
    }

    /// Copy the merged artifact to `outputs`. The state is only marked
    /// distributed once every copy succeeded, so a failure is retried by
    /// the next sweep even though the fingerprint no longer changes.
    fn distribute(
        &self,
        state: &mut ActivityCompactionState,
        outputs: &[String],
    ) -> Result<(), CompactError> {
        let Some(local) = state.local_state_path() else {
            return Ok(());
        };
        if outputs.is_empty() {
            warn!(activity_id = %state.activity_id(), "no outputs to distribute to, activity has no owners");
        }
        for path in outputs {
            self.store().upload(&local, path)?;
        }
        state.mark_distributed();
        info!(activity_id = %state.activity_id(), outputs = ?outputs, "distributed compacted traces");
        Ok(())
    }

    /// Merge one fragment announced by the event feed.
    pub fn process_record(
        &self,
        registry: &mut CompactorRegistry,
        record: &FeedRecord,
    ) -> Result<EventOutcome, CompactError> {
        let key = FragmentKey::parse(&record.key, &self.config.store)?;
        debug!(activity_id = %key.activity_id, fragment = %key.fragment_name, offset = ?record.offset, "received fragment");

        if registry.get(&key.activity_id).is_none() {
            registry.create(&key.activity_id)?;
        }
        let state = registry
            .get_mut(&key.activity_id)
            .ok_or_else(|| StateError::InvalidId(key.activity_id.clone()))?;

        if state.files()?.iter().any(|f| *f == key.path) {
            debug!(activity_id = %key.activity_id, path = %key.path, "fragment already merged");
            return Ok(EventOutcome::Duplicate);
        }

        let merged = self.merge_fragment(state, &key.path);
        // a merge that reached the cache but not every output is still saved
        registry.save()?;
        merged?;
        Ok(EventOutcome::Merged)
    }

    fn merge_fragment(
        &self,
        state: &mut ActivityCompactionState,
        path: &str,
    ) -> Result<(), CompactError> {
        let added = [path.to_string()];
        let sha1 = fingerprint(&added);
        state.update(&added, self.clock.now(), &sha1)?;
        let outputs = self.event_output_paths(state);
        self.distribute(state, &outputs)
    }

    /// Drain `feed`, merging each record. Bad records are logged and
    /// skipped; a feed read error ends consumption.
    pub fn consume(&self, mut feed: impl EventFeed) -> Result<ConsumeReport, CompactError> {
        let mut registry = self.load_registry()?;
        let mut report = ConsumeReport::default();

        while !self.shutdown.is_requested() {
            let Some(record) = feed.next_record()? else {
                break;
            };
            report.records += 1;
            match self.process_record(&mut registry, &record) {
                Ok(EventOutcome::Merged) => report.merged += 1,
                Ok(EventOutcome::Duplicate) => report.duplicates += 1,
                Err(CompactError::Key(err)) => {
                    report.malformed += 1;
                    warn!(key = %record.key, error = %err, "dropping event with malformed key");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %record.key, error = %err, code = err.code().code(), "event processing failed");
                }
            }
        }
        info!(
            records = report.records,
            merged = report.merged,
            duplicates = report.duplicates,
            "event consumption finished"
        );
        Ok(report)
    }

    /// Check every known activity. With `recover`, forget the inconsistent
    /// ones and save the snapshot.
    pub fn check(&self, recover: bool) -> Result<CheckReport, CompactError> {
        let mut registry = self.load_registry()?;
        let mut report = CheckReport::default();
        for id in registry.known_activities() {
            let Some(state) = registry.get(&id) else {
                continue;
            };
            match self.check_activity(state) {
                Ok(check) => report.checks.push(check),
                Err(err) => {
                    warn!(activity_id = %id, error = %err, "consistency check could not complete");
                    report.errors.push(id);
                }
            }
        }

        if recover {
            let failing: Vec<String> = report.inconsistent().into_iter().map(String::from).collect();
            for id in failing {
                if registry.remove(&id)? {
                    report.recovered.push(id);
                }
            }
            registry.save()?;
        }
        Ok(report)
    }

    /// Registry-wide GC; `force` ignores the interval.
    pub fn gc(&self, force: bool) -> Result<GcReport, CompactError> {
        let mut registry = self.load_registry()?;
        let report = registry.garbage_collect_with(force);
        if report.ran {
            registry.save()?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, epoch};
    use crate::directory::StaticDirectory;
    use crate::store::MemoryBlobStore;
    use tempfile::TempDir;

    fn compactor(dir: &TempDir) -> (Compactor, Arc<MemoryBlobStore>, Arc<StaticDirectory>) {
        compactor_with(dir, |_| {})
    }

    fn compactor_with(
        dir: &TempDir,
        configure: impl FnOnce(&mut CompactorConfig),
    ) -> (Compactor, Arc<MemoryBlobStore>, Arc<StaticDirectory>) {
        let store = Arc::new(MemoryBlobStore::new());
        let directory = Arc::new(StaticDirectory::new(vec![Activity::new("A1", ["bob", "alice"])]));
        let mut config = CompactorConfig {
            local_state_path: dir.path().join("state"),
            batch_size: 1,
            ..CompactorConfig::default()
        };
        configure(&mut config);
        let shared_store: Arc<dyn BlobStore> = store.clone();
        let shared_directory: Arc<dyn ActivityDirectory> = directory.clone();
        let compactor = Compactor::new(
            config,
            shared_store,
            shared_directory,
            Arc::new(ManualClock::new(epoch())),
        );
        (compactor, store, directory)
    }

    #[test]
    fn status_starts_idle() {
        let status = StatusHandle::default();
        assert!(!status.is_processing());
        assert_eq!(status.current(), None);
        assert_eq!(status.total(), None);
        assert_eq!(status.elapsed_time(epoch()), "PT0S");
    }

    #[test]
    fn guard_clears_processing_flag() {
        let status = StatusHandle::default();
        {
            let _guard = status.try_begin(epoch()).expect("first");
            assert!(status.is_processing());
            assert!(status.try_begin(epoch()).is_none());
        }
        assert!(!status.is_processing());
        assert_eq!(status.start_time(), Some(epoch()));
    }

    #[test]
    fn overlapping_sweep_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let (compactor, _store, _directory) = compactor(&dir);
        let _guard = compactor.status.try_begin(epoch()).expect("hold");
        assert!(matches!(compactor.compact(), SweepOutcome::AlreadyRunning));
    }

    #[test]
    fn failed_sweep_releases_the_flag() {
        let dir = TempDir::new().expect("tempdir");
        let (compactor, store, _directory) = compactor(&dir);
        store.fail_prefix("state/");

        assert!(matches!(compactor.compact(), SweepOutcome::Failed(_)));
        assert!(!compactor.status().is_processing());

        store.heal();
        assert!(matches!(compactor.compact(), SweepOutcome::Completed(_)));
    }

    #[test]
    fn owners_are_sorted_on_first_sight() {
        let dir = TempDir::new().expect("tempdir");
        let (compactor, _store, _directory) = compactor(&dir);
        let SweepOutcome::Completed(report) = compactor.compact() else {
            panic!("sweep failed");
        };
        assert_eq!(report.created, 1);
        assert_eq!(report.unchanged, 0);

        let registry = compactor.load_registry().expect("load");
        assert_eq!(registry.get("A1").expect("A1").owners(), ["alice", "bob"]);
    }

    #[test]
    fn shutdown_interrupts_before_next_activity() {
        let dir = TempDir::new().expect("tempdir");
        let (compactor, _store, _directory) = compactor(&dir);
        compactor.shutdown_handle().request();
        let SweepOutcome::Completed(report) = compactor.compact() else {
            panic!("sweep failed");
        };
        assert!(report.interrupted);
        assert_eq!(report.created, 0);
    }

    #[test]
    fn unvalidated_zero_save_every_still_sweeps() {
        let dir = TempDir::new().expect("tempdir");
        let (compactor, store, _directory) = compactor_with(&dir, |c| c.save_every = 0);
        let SweepOutcome::Completed(report) = compactor.compact() else {
            panic!("sweep failed");
        };
        assert_eq!(report.created, 1);
        assert!(store.object("state/state.json").is_some());
    }
}
