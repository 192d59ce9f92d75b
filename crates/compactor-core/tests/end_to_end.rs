//! Full-sweep integration tests over the in-memory store, a static activity
//! directory and a manual clock.

use std::io::Cursor;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use compactor_core::clock::{Clock, ManualClock};
use compactor_core::compactor::{Compactor, ConsumeReport, SweepOutcome, SweepReport};
use compactor_core::config::{CompactorConfig, OutputMode};
use compactor_core::directory::{Activity, ActivityDirectory, StaticDirectory};
use compactor_core::feed::JsonLinesFeed;
use compactor_core::store::{BlobStore, MemoryBlobStore};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    store: Arc<MemoryBlobStore>,
    directory: Arc<StaticDirectory>,
    clock: Arc<ManualClock>,
    config: CompactorConfig,
    compactor: Compactor,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .expect("valid date")
}

fn fragment(activity: &str, name: &str) -> String {
    format!("kafka-topics/traces/_id={activity}/{name}")
}

fn payload(name: &str) -> String {
    format!("{{\"event\":\"{name}\"}}\n")
}

impl Harness {
    fn new(configure: impl FnOnce(&mut CompactorConfig)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = CompactorConfig {
            local_state_path: dir.path().join("state"),
            ..CompactorConfig::default()
        };
        configure(&mut config);

        let store = Arc::new(MemoryBlobStore::new());
        let directory = Arc::new(StaticDirectory::default());
        let clock = Arc::new(ManualClock::new(start()));
        let compactor = build(&config, &store, &directory, &clock);
        Self {
            dir,
            store,
            directory,
            clock,
            config,
            compactor,
        }
    }

    /// A fresh compactor over the same store and cache, as after a restart.
    fn restart(&mut self) {
        self.compactor = build(&self.config, &self.store, &self.directory, &self.clock);
    }

    fn add_fragments(&self, activity: &str, names: &[&str]) {
        for name in names {
            self.store.insert(fragment(activity, name), payload(name));
        }
    }

    fn set_activities(&self, activities: Vec<Activity>) {
        self.directory.set_activities(activities);
    }

    fn sweep(&self) -> SweepReport {
        match self.compactor.compact() {
            SweepOutcome::Completed(report) => report,
            other => panic!("sweep did not complete: {other:?}"),
        }
    }

    fn output(&self, owner: &str, activity: &str) -> Option<String> {
        self.store
            .object(&format!("users/{owner}/{activity}/traces_v2.json"))
            .map(|bytes| String::from_utf8(bytes).expect("utf8"))
    }

    fn owners(&self, activity: &str) -> Vec<String> {
        let registry = self.compactor.load_registry().expect("registry");
        registry.get(activity).expect("known").owners().to_vec()
    }

    fn current_sha1(&self, activity: &str) -> Option<String> {
        let registry = self.compactor.load_registry().expect("registry");
        registry
            .get(activity)
            .and_then(|s| s.current_sha1().map(String::from))
    }
}

fn build(
    config: &CompactorConfig,
    store: &Arc<MemoryBlobStore>,
    directory: &Arc<StaticDirectory>,
    clock: &Arc<ManualClock>,
) -> Compactor {
    let store: Arc<dyn BlobStore> = store.clone();
    let directory: Arc<dyn ActivityDirectory> = directory.clone();
    let clock: Arc<dyn Clock> = clock.clone();
    Compactor::new(config.clone(), store, directory, clock)
}

#[test]
fn merge_skip_then_owner_removal() {
    let h = Harness::new(|c| c.batch_size = 2);
    h.set_activities(vec![Activity::new("A1", ["alice", "bob"])]);
    h.add_fragments("A1", &["f2", "f1"]);

    let first = h.sweep();
    assert_eq!(first.created, 1);
    assert_eq!(first.compacted, 1);
    let merged = format!("{}{}", payload("f1"), payload("f2"));
    assert_eq!(h.output("alice", "A1").as_deref(), Some(merged.as_str()));
    assert_eq!(h.output("bob", "A1").as_deref(), Some(merged.as_str()));
    let s1 = h.current_sha1("A1").expect("compacted");

    let reads = h.store.reads();
    let second = h.sweep();
    assert_eq!(second.unchanged, 1);
    assert_eq!(second.compacted, 0);
    assert_eq!(h.store.reads(), reads, "unchanged sweep must not fetch fragments");
    assert_eq!(h.current_sha1("A1"), Some(s1));

    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    let third = h.sweep();
    assert_eq!(third.failed, 0);
    assert_eq!(h.output("bob", "A1"), None);
    assert!(h.output("alice", "A1").is_some());
    assert_eq!(h.owners("A1"), vec!["alice"]);
}

#[test]
fn added_owner_receives_output_on_next_merge() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();

    h.set_activities(vec![Activity::new("A1", ["alice", "carol"])]);
    h.add_fragments("A1", &["f2"]);
    h.sweep();

    assert_eq!(h.owners("A1"), vec!["alice", "carol"]);
    let merged = format!("{}{}", payload("f1"), payload("f2"));
    assert_eq!(h.output("carol", "A1").as_deref(), Some(merged.as_str()));
}

#[test]
fn batching_gate_waits_for_size_or_delay() {
    let h = Harness::new(|c| {
        c.batch_size = 3;
        c.max_delay_ms = 5 * 60 * 1000;
    });
    h.set_activities(vec![Activity::new("A1", ["alice"])]);

    // never updated: the delay since epoch has long passed
    h.add_fragments("A1", &["f1"]);
    assert_eq!(h.sweep().compacted, 1);

    h.add_fragments("A1", &["f2"]);
    let postponed = h.sweep();
    assert_eq!(postponed.postponed, 1);
    assert_eq!(postponed.compacted, 0);

    h.add_fragments("A1", &["f3", "f4"]);
    assert_eq!(h.sweep().compacted, 1, "three new fragments reach the batch size");

    h.add_fragments("A1", &["f5"]);
    assert_eq!(h.sweep().postponed, 1);
    h.clock.advance(Duration::minutes(4));
    assert_eq!(h.sweep().postponed, 1);
    h.clock.advance(Duration::minutes(1));
    assert_eq!(h.sweep().compacted, 1, "max delay reached");

    let expected: String = ["f1", "f2", "f3", "f4", "f5"].iter().map(|n| payload(n)).collect();
    assert_eq!(h.output("alice", "A1").as_deref(), Some(expected.as_str()));
}

#[test]
fn vanished_activity_is_purged() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![
        Activity::new("A1", ["alice"]),
        Activity::new("A2", ["bob"]),
    ]);
    h.add_fragments("A1", &["f1"]);
    h.add_fragments("A2", &["f1"]);
    assert_eq!(h.sweep().compacted, 2);

    h.set_activities(vec![Activity::new("A2", ["bob"])]);
    let report = h.sweep();
    assert_eq!(report.removed, 1);

    let registry = h.compactor.load_registry().expect("registry");
    assert_eq!(registry.known_activities(), vec!["A2"]);
    assert!(!h.dir.path().join("state/A1").exists());
    assert!(h.store.list("state/A1/").expect("list").is_empty());
    assert!(!h.store.list("state/A2/").expect("list").is_empty());
}

#[test]
fn dry_run_keeps_everything_but_logs() {
    let h = Harness::new(|c| {
        c.batch_size = 1;
        c.remove_dry_run = true;
    });
    h.set_activities(vec![Activity::new("A1", ["alice", "bob"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();

    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.sweep();
    assert!(h.output("bob", "A1").is_some(), "dry run must not delete outputs");
    assert_eq!(h.owners("A1"), vec!["alice"]);

    h.set_activities(vec![]);
    let report = h.sweep();
    assert_eq!(report.removed, 0);
    assert!(h.dir.path().join("state/A1").exists());
}

#[test]
fn recovery_rebuilds_inconsistent_activity() {
    let h = Harness::new(|c| {
        c.batch_size = 1;
        c.recovery = true;
    });
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.add_fragments("A1", &["f1", "f2"]);
    h.sweep();
    let sha = h.current_sha1("A1").expect("compacted");

    h.store.remove(&format!("state/A1/{sha}-state.txt")).expect("remove");
    let report = h.sweep();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.created, 1);
    assert_eq!(report.compacted, 1);

    let check = h.compactor.check(false).expect("check");
    assert!(check.inconsistent().is_empty());
    let merged = format!("{}{}", payload("f1"), payload("f2"));
    assert_eq!(h.output("alice", "A1").as_deref(), Some(merged.as_str()));
}

#[test]
fn inconsistency_without_recovery_only_warns() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();

    h.store
        .remove("users/alice/A1/traces_v2.json")
        .expect("remove output");
    let report = h.sweep();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.unchanged, 1);

    let check = h.compactor.check(false).expect("check");
    assert_eq!(check.inconsistent(), vec!["A1"]);
    assert_eq!(
        check.checks[0].missing_outputs,
        vec!["users/alice/A1/traces_v2.json"]
    );

    let recovered = h.compactor.check(true).expect("recover");
    assert_eq!(recovered.recovered, vec!["A1"]);
    assert_eq!(h.compactor.load_registry().expect("registry").size(), 0);
}

#[test]
fn one_failing_activity_does_not_stop_the_sweep() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![
        Activity::new("A1", ["alice"]),
        Activity::new("A2", ["bob"]),
    ]);
    h.add_fragments("A1", &["f1"]);
    h.add_fragments("A2", &["f1"]);
    h.store.fail_prefix(fragment("A1", "f1"));

    let report = h.sweep();
    assert_eq!(report.failed, 1);
    assert_eq!(report.compacted, 1);
    assert_eq!(h.current_sha1("A1"), None);

    h.store.heal();
    let retry = h.sweep();
    assert_eq!(retry.compacted, 1);
    assert_eq!(retry.unchanged, 1);
}

#[test]
fn failed_distribution_is_retried_next_sweep() {
    let mut h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["alice", "bob"])]);
    h.add_fragments("A1", &["f1"]);
    h.store.fail_prefix("users/");

    let first = h.sweep();
    assert_eq!(first.failed, 1);
    assert_eq!(first.compacted, 0);
    assert_eq!(h.output("alice", "A1"), None);
    assert!(h.current_sha1("A1").is_some(), "merge itself went through");

    h.store.heal();
    h.restart();
    h.clock.advance(Duration::hours(1));
    let second = h.sweep();
    assert_eq!(second.redistributed, 1);
    assert_eq!(second.unchanged, 0);
    assert_eq!(second.failed, 0);
    for owner in ["alice", "bob"] {
        assert_eq!(h.output(owner, "A1").as_deref(), Some(payload("f1").as_str()));
    }

    let reads = h.store.reads();
    let third = h.sweep();
    assert_eq!(third.unchanged, 1);
    assert_eq!(third.redistributed, 0);
    assert_eq!(h.store.reads(), reads);
}

#[test]
fn unusable_owner_names_are_ignored() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["../../escaped", "alice", ".."])]);
    h.add_fragments("A1", &["f1"]);

    let report = h.sweep();
    assert_eq!(report.compacted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.owners("A1"), vec!["alice"]);
    assert!(h.output("alice", "A1").is_some());
    assert!(h.store.keys().iter().all(|key| !key.contains("..")), "{:?}", h.store.keys());
}

#[test]
fn restart_resumes_from_snapshot() {
    let mut h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();
    assert!(h.store.exists("state/state.json").expect("exists"));

    h.restart();
    let report = h.sweep();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.created, 0);
}

#[test]
fn lost_local_cache_is_rebuilt_from_remote_mirror() {
    let mut h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();

    std::fs::remove_dir_all(h.dir.path().join("state")).expect("wipe cache");
    h.restart();
    h.add_fragments("A1", &["f2"]);
    let report = h.sweep();
    assert_eq!(report.compacted, 1);

    let merged = format!("{}{}", payload("f1"), payload("f2"));
    assert_eq!(h.output("alice", "A1").as_deref(), Some(merged.as_str()));
}

#[test]
fn forced_gc_reclaims_superseded_artifacts() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();
    let old = h.current_sha1("A1").expect("first");
    h.add_fragments("A1", &["f2"]);
    h.sweep();
    let current = h.current_sha1("A1").expect("second");

    let not_due = h.compactor.gc(false).expect("gc");
    assert!(!not_due.ran, "the first sweep already ran GC");

    let report = h.compactor.gc(true).expect("gc");
    assert!(report.ran);
    assert_eq!(report.collected, 1);

    let local = h.dir.path().join("state/A1");
    assert!(!local.join(format!("{old}-state.txt")).exists());
    assert!(local.join(format!("{current}-state.txt")).exists());
    assert!(!h.store.exists(&format!("state/A1/{old}-files.txt")).expect("exists"));
    assert!(h.compactor.check(false).expect("check").inconsistent().is_empty());
}

#[test]
fn shared_output_mode_writes_one_artifact() {
    let h = Harness::new(|c| {
        c.batch_size = 1;
        c.output = OutputMode::Shared;
    });
    h.set_activities(vec![Activity::new("A1", ["alice", "bob"])]);
    h.add_fragments("A1", &["f1"]);
    h.sweep();

    assert!(h.store.exists("outputs/A1/traces_v2.json").expect("exists"));
    assert_eq!(h.output("alice", "A1"), None);
}

#[test]
fn event_feed_merges_single_fragments() {
    let h = Harness::new(|c| {
        c.batch_size = 1;
        c.output = OutputMode::Shared;
    });
    h.add_fragments("A1", &["f1", "f2"]);

    let lines = [
        format!(r#"{{"Key": "traces/{}"}}"#, fragment("A1", "f1")),
        r#"{"Key": "traces/somewhere/else.json"}"#.to_string(),
        format!(r#"{{"key": "traces/{}", "offset": 7}}"#, fragment("A1", "f1")),
        "garbage".to_string(),
        format!(r#"{{"Key": "traces/{}"}}"#, fragment("A1", "f2")),
    ];
    let feed = JsonLinesFeed::new(Cursor::new(lines.join("\n")));
    let report = h.compactor.consume(feed).expect("consume");

    assert_eq!(
        report,
        ConsumeReport {
            records: 4,
            merged: 2,
            duplicates: 1,
            malformed: 1,
            failed: 0,
        }
    );
    let merged = format!("{}{}", payload("f1"), payload("f2"));
    let shared = h
        .store
        .object("outputs/A1/traces_v2.json")
        .map(|b| String::from_utf8(b).expect("utf8"));
    assert_eq!(shared.as_deref(), Some(merged.as_str()));

    // a later sweep sees both fragments as already merged
    h.set_activities(vec![Activity::new("A1", Vec::<String>::new())]);
    h.clock.advance(Duration::hours(1));
    let sweep = h.sweep();
    assert_eq!(sweep.compacted, 1);
    let shared = h
        .store
        .object("outputs/A1/traces_v2.json")
        .map(|b| String::from_utf8(b).expect("utf8"));
    assert_eq!(shared.as_deref(), Some(merged.as_str()));
}

#[test]
fn event_feed_in_owner_mode_writes_shared_output() {
    let h = Harness::new(|c| c.batch_size = 1);
    h.add_fragments("A1", &["f1"]);
    let record = |name: &str| format!(r#"{{"Key": "traces/{}"}}"#, fragment("A1", name));
    let shared = || {
        h.store
            .object("outputs/A1/traces_v2.json")
            .map(|b| String::from_utf8(b).expect("utf8"))
    };

    let report = h
        .compactor
        .consume(JsonLinesFeed::new(Cursor::new(record("f1"))))
        .expect("consume");
    assert_eq!(report.merged, 1);
    assert_eq!(shared().as_deref(), Some(payload("f1").as_str()));

    // owners learned by a sweep also receive later event merges
    h.set_activities(vec![Activity::new("A1", ["alice"])]);
    assert_eq!(h.sweep().unchanged, 1);
    h.add_fragments("A1", &["f2"]);
    let report = h
        .compactor
        .consume(JsonLinesFeed::new(Cursor::new(record("f2"))))
        .expect("consume");
    assert_eq!(report.merged, 1);

    let merged = format!("{}{}", payload("f1"), payload("f2"));
    assert_eq!(shared().as_deref(), Some(merged.as_str()));
    assert_eq!(h.output("alice", "A1").as_deref(), Some(merged.as_str()));
}

#[test]
fn status_is_idle_after_sweep() {
    let h = Harness::new(|_| {});
    h.set_activities(vec![Activity::new("A1", ["alice"]), Activity::new("A2", ["bob"])]);
    h.sweep();

    let status = h.compactor.status();
    assert!(!status.is_processing());
    assert_eq!(status.total(), Some(2));
    assert_eq!(status.current(), Some(1));
    assert_eq!(status.start_time(), Some(start()));
    h.clock.advance(Duration::seconds(63));
    assert_eq!(status.elapsed_time(h.clock.now()), "PT1M3S");
}
