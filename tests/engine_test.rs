//! Engine behaviour with scripted analyzers: isolation, skipping, batching, caching.

use parking_lot::Mutex;
use serde_json::{json, Map};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use xcoffscan::config::{ObjectMode, DEFAULT_MAX_OUTPUT_BYTES};
use xcoffscan::snapshot::meta;
use xcoffscan::{
    AnalysisEngine, AnalysisOutcome, Analyzer, AnalyzerDescriptor, AnalyzerOptions, Capability,
    EngineConfig, Registry, Selection, Snapshot,
};

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    Panic,
    /// Reports the output budget it ran under; truncated below the default budget
    Budget,
}

struct Probe {
    descriptor: AnalyzerDescriptor,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Analyzer for Probe {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(self.descriptor.name.clone());
        match self.behavior {
            Behavior::Succeed => {
                let mut data = Map::new();
                data.insert("path".into(), json!(path.to_string_lossy()));
                AnalysisOutcome::success(self.descriptor.name.clone(), data)
            }
            Behavior::Fail => AnalysisOutcome::failure(self.descriptor.name.clone(), "tool said no"),
            Behavior::Panic => panic!("analyzer exploded"),
            Behavior::Budget => {
                let mut data = Map::new();
                data.insert("budget".into(), json!(options.max_output_bytes));
                data.insert("mode".into(), json!(options.object_mode.flag()));
                AnalysisOutcome::success(self.descriptor.name.clone(), data)
                    .with_truncated(options.max_output_bytes < DEFAULT_MAX_OUTPUT_BYTES)
            }
        }
    }
}

/// An analyzer whose requirement check itself blows up
struct BrokenCheck {
    descriptor: AnalyzerDescriptor,
    calls: Arc<AtomicUsize>,
}

impl Analyzer for BrokenCheck {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, _path: &Path, _options: &AnalyzerOptions) -> AnalysisOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        AnalysisOutcome::success(self.descriptor.name.clone(), Map::new())
    }

    fn check_requirements(&self) -> Vec<String> {
        panic!("PATH lookup exploded")
    }
}

struct Harness {
    registry: Registry,
    calls: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Registry::new(),
            calls: Arc::new(AtomicUsize::new(0)),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn add(&mut self, descriptor: AnalyzerDescriptor, behavior: Behavior) {
        let probe = Probe {
            descriptor,
            behavior,
            calls: Arc::clone(&self.calls),
            events: Arc::clone(&self.events),
        };
        self.registry.register(Arc::new(probe), false).unwrap();
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

fn target(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("sample.o");
    std::fs::write(&path, b"not really an object file").unwrap();
    path
}

fn engine(config: EngineConfig) -> AnalysisEngine {
    AnalysisEngine::new(config).unwrap()
}

#[test]
fn test_failures_are_isolated() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("good", "Good").priority(1), Behavior::Succeed);
    h.add(AnalyzerDescriptor::new("bad", "Bad").priority(2), Behavior::Fail);
    h.add(AnalyzerDescriptor::new("boom", "Boom").priority(3), Behavior::Panic);

    let snapshot = engine(EngineConfig::default())
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();

    assert_eq!(snapshot.results.len(), 3);
    assert!(snapshot.results["good"].success);

    let bad = &snapshot.results["bad"];
    assert!(!bad.success);
    assert_eq!(bad.error.as_deref(), Some("tool said no"));
    assert_eq!(bad.metadata[meta::STATE], "failed");

    let boom = &snapshot.results["boom"];
    assert!(!boom.success);
    assert!(boom.error.as_deref().unwrap().contains("analyzer exploded"));
    assert_eq!(snapshot.tally(), (1, 2, 0));
}

#[test]
fn test_missing_tool_skips_without_analyzing() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(
        AnalyzerDescriptor::new("needs-tool", "Needs tool").requires("xcoffscan-no-such-tool-zz"),
        Behavior::Succeed,
    );

    let snapshot = engine(EngineConfig::default())
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();

    let outcome = &snapshot.results["needs-tool"];
    assert!(!outcome.success);
    assert!(outcome.is_skipped());
    assert_eq!(outcome.error.as_deref(), Some("missing commands: xcoffscan-no-such-tool-zz"));
    assert_eq!(outcome.metadata[meta::STATE], "skipped");
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_skip_does_not_trigger_fail_fast() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(
        AnalyzerDescriptor::new("skipped", "Skipped").priority(1).requires("xcoffscan-no-such-tool-zz"),
        Behavior::Succeed,
    );
    h.add(AnalyzerDescriptor::new("after", "After").priority(2), Behavior::Succeed);

    let config = EngineConfig {
        fail_fast: true,
        ..Default::default()
    };
    let snapshot = engine(config)
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();
    assert_eq!(snapshot.results.len(), 2);
    assert!(snapshot.results["after"].success);
}

#[test]
fn test_fail_fast_stops_launching() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("first", "First").priority(1), Behavior::Fail);
    h.add(AnalyzerDescriptor::new("second", "Second").priority(2), Behavior::Succeed);
    h.add(AnalyzerDescriptor::new("third", "Third").priority(3), Behavior::Succeed);

    let config = EngineConfig {
        fail_fast: true,
        ..Default::default()
    };
    let snapshot = engine(config)
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();

    assert_eq!(snapshot.results.keys().collect::<Vec<_>>(), vec!["first"]);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fail_fast_in_concurrent_batch_skips_sequential_batch() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(
        AnalyzerDescriptor::new("parallel", "Parallel")
            .priority(50)
            .capability(Capability::ConcurrentSafe),
        Behavior::Fail,
    );
    h.add(AnalyzerDescriptor::new("serial", "Serial").priority(1), Behavior::Succeed);

    let config = EngineConfig {
        fail_fast: true,
        ..Default::default()
    };
    let snapshot = engine(config)
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();
    assert!(snapshot.results.contains_key("parallel"));
    assert!(!snapshot.results.contains_key("serial"));
}

#[test]
fn test_concurrent_batch_runs_before_sequential_batch() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("serial-a", "A").priority(1), Behavior::Succeed);
    h.add(AnalyzerDescriptor::new("serial-b", "B").priority(2), Behavior::Succeed);
    for name in ["par-1", "par-2", "par-3"] {
        h.add(
            AnalyzerDescriptor::new(name, name)
                .priority(90)
                .capability(Capability::ConcurrentSafe),
            Behavior::Succeed,
        );
    }

    let config = EngineConfig {
        max_concurrency: 3,
        ..Default::default()
    };
    engine(config)
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();

    let events = h.events();
    assert_eq!(events.len(), 5);
    assert!(events[..3].iter().all(|e| e.starts_with("par-")));
    assert_eq!(&events[3..], ["serial-a", "serial-b"]);
}

#[test]
fn test_selection_and_metadata() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("one", "One").priority(1), Behavior::Succeed);
    h.add(AnalyzerDescriptor::new("two", "Two").priority(2), Behavior::Succeed);
    h.add(
        AnalyzerDescriptor::new("off", "Off").priority(3).default_enabled(false),
        Behavior::Succeed,
    );

    let path = target(&dir);
    let snapshot = engine(EngineConfig::default())
        .run(&h.registry, &path, &Selection::only(["off", "two"]))
        .unwrap();
    assert_eq!(snapshot.results.keys().collect::<Vec<_>>(), vec!["off", "two"]);

    let outcome = &snapshot.results["two"];
    assert!(outcome.duration_ms().is_some());
    assert_eq!(outcome.metadata[meta::STATE], "succeeded");
    assert_eq!(outcome.metadata[meta::ANALYZER_VERSION], "1.0");

    assert!(Path::new(&snapshot.filepath).is_absolute());
    assert_eq!(snapshot.file_size, std::fs::metadata(&path).unwrap().len());
    assert_eq!(snapshot.file_type, "unknown");
}

#[test]
fn test_snapshot_round_trips_through_json() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("one", "One"), Behavior::Succeed);
    h.add(AnalyzerDescriptor::new("two", "Two"), Behavior::Fail);

    let snapshot = engine(EngineConfig::default())
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();
    let restored = Snapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(restored, snapshot);
}

#[test]
fn test_detects_xcoff_file_type() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiny.o");
    let mut header = vec![0u8; 20];
    header[..2].copy_from_slice(&0x01DFu16.to_be_bytes());
    std::fs::write(&path, &header).unwrap();

    let snapshot = engine(EngineConfig::default())
        .run(&Registry::new(), &path, &Selection::all_enabled())
        .unwrap();
    assert_eq!(snapshot.file_type, "xcoff32");
    assert!(snapshot.results.is_empty());
}

#[test]
fn test_cache_serves_second_run() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("cached", "Cached"), Behavior::Succeed);

    let config = EngineConfig {
        cache_dir: Some(cache.path().to_path_buf()),
        ..Default::default()
    };
    let engine = engine(config);
    let path = target(&dir);

    let first = engine.run(&h.registry, &path, &Selection::all_enabled()).unwrap();
    assert!(!first.results["cached"].metadata.contains_key(meta::CACHE_HIT));

    let second = engine.run(&h.registry, &path, &Selection::all_enabled()).unwrap();
    assert_eq!(second.results["cached"].metadata[meta::CACHE_HIT], true);
    assert_eq!(second.results["cached"].data, first.results["cached"].data);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failures_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("flaky", "Flaky"), Behavior::Fail);

    let config = EngineConfig {
        cache_dir: Some(cache.path().to_path_buf()),
        ..Default::default()
    };
    let engine = engine(config);
    let path = target(&dir);
    engine.run(&h.registry, &path, &Selection::all_enabled()).unwrap();
    engine.run(&h.registry, &path, &Selection::all_enabled()).unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cache_respects_analyzer_options() {
    let dir = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let mut h = Harness::new();
    h.add(AnalyzerDescriptor::new("budgeted", "Budgeted"), Behavior::Budget);
    let path = target(&dir);

    let with_options = |options: AnalyzerOptions| {
        engine(EngineConfig {
            options,
            cache_dir: Some(cache.path().to_path_buf()),
            ..Default::default()
        })
    };
    let tight = AnalyzerOptions {
        max_output_bytes: 100,
        ..Default::default()
    };

    let first = with_options(tight.clone())
        .run(&h.registry, &path, &Selection::all_enabled())
        .unwrap();
    assert!(first.results["budgeted"].truncated);

    // A truncated result is never served, not even to the same limits
    let again = with_options(tight)
        .run(&h.registry, &path, &Selection::all_enabled())
        .unwrap();
    assert!(!again.results["budgeted"].metadata.contains_key(meta::CACHE_HIT));
    assert_eq!(h.calls.load(Ordering::SeqCst), 2);

    let full = with_options(AnalyzerOptions::default())
        .run(&h.registry, &path, &Selection::all_enabled())
        .unwrap();
    let outcome = &full.results["budgeted"];
    assert!(!outcome.truncated);
    assert!(!outcome.metadata.contains_key(meta::CACHE_HIT));
    assert_eq!(outcome.data["budget"], DEFAULT_MAX_OUTPUT_BYTES);
    assert_eq!(h.calls.load(Ordering::SeqCst), 3);

    // Different object mode, different entry
    let wide = with_options(AnalyzerOptions {
        object_mode: ObjectMode::Bits64,
        ..Default::default()
    })
    .run(&h.registry, &path, &Selection::all_enabled())
    .unwrap();
    assert!(!wide.results["budgeted"].metadata.contains_key(meta::CACHE_HIT));
    assert_eq!(wide.results["budgeted"].data["mode"], "-X64");
    assert_eq!(h.calls.load(Ordering::SeqCst), 4);

    // Same options as the full run: served from the cache
    let repeat = with_options(AnalyzerOptions::default())
        .run(&h.registry, &path, &Selection::all_enabled())
        .unwrap();
    assert_eq!(repeat.results["budgeted"].metadata[meta::CACHE_HIT], true);
    assert_eq!(repeat.results["budgeted"].data, outcome.data);
    assert_eq!(h.calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_panicking_requirement_check_is_isolated() {
    let dir = TempDir::new().unwrap();
    let mut h = Harness::new();
    let broken_calls = Arc::new(AtomicUsize::new(0));
    h.registry
        .register(
            Arc::new(BrokenCheck {
                descriptor: AnalyzerDescriptor::new("broken", "Broken")
                    .capability(Capability::ConcurrentSafe)
                    .priority(1),
                calls: Arc::clone(&broken_calls),
            }),
            false,
        )
        .unwrap();
    h.add(
        AnalyzerDescriptor::new("steady", "Steady")
            .capability(Capability::ConcurrentSafe)
            .priority(2),
        Behavior::Succeed,
    );

    let config = EngineConfig {
        max_concurrency: 2,
        ..Default::default()
    };
    let snapshot = engine(config)
        .run(&h.registry, &target(&dir), &Selection::all_enabled())
        .unwrap();

    let broken = &snapshot.results["broken"];
    assert!(!broken.success);
    assert!(!broken.is_skipped());
    assert!(broken
        .error
        .as_deref()
        .unwrap()
        .contains("requirement check panicked: PATH lookup exploded"));
    assert_eq!(broken.metadata[meta::STATE], "failed");
    assert_eq!(broken_calls.load(Ordering::SeqCst), 0);
    assert!(snapshot.results["steady"].success);
}
