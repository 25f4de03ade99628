//! Analysis engine: runs the selected analyzers against one file.
//!
//! Every analyzer moves through
//! `Pending -> Checking -> (Skipped | Running) -> (Succeeded | Failed) -> Recorded`.
//! Concurrent-safe analyzers run first on a bounded worker pool, the rest run
//! afterwards one at a time in priority order. A failing or panicking analyzer
//! only affects its own outcome unless `fail_fast` is set, in which case no
//! further analyzer is launched and the partial snapshot is returned.

use crate::analyzers::Analyzer;
use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::registry::{panic_message, Registry};
use crate::snapshot::{meta, AnalysisOutcome, Snapshot};
use crate::validate::detect_file_type;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one analyzer within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerState {
    Pending,
    Checking,
    Skipped,
    Running,
    Succeeded,
    Failed,
    Recorded,
}

impl AnalyzerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzerState::Pending => "pending",
            AnalyzerState::Checking => "checking",
            AnalyzerState::Skipped => "skipped",
            AnalyzerState::Running => "running",
            AnalyzerState::Succeeded => "succeeded",
            AnalyzerState::Failed => "failed",
            AnalyzerState::Recorded => "recorded",
        }
    }
}

impl std::fmt::Display for AnalyzerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which analyzers a run uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Explicit names in run order; None selects every enabled analyzer
    pub names: Option<Vec<String>>,
    pub exclude: Vec<String>,
}

impl Selection {
    pub fn all_enabled() -> Self {
        Self::default()
    }

    pub fn only<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: Some(names.into_iter().map(Into::into).collect()),
            exclude: Vec::new(),
        }
    }

    pub fn excluding<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Identity of the file under analysis
struct Target {
    path: PathBuf,
    size: u64,
    mtime: DateTime<Utc>,
}

impl Target {
    fn resolve(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::target_not_found(path),
            _ => Error::invalid_input(path, format!("cannot stat: {}", e)),
        })?;
        if !metadata.is_file() {
            return Err(Error::invalid_input(path, "not a regular file"));
        }
        fs::File::open(path).map_err(|e| Error::invalid_input(path, format!("unreadable: {}", e)))?;

        let path = fs::canonicalize(path)?;
        let mtime = metadata.modified().map(DateTime::<Utc>::from)?;
        Ok(Self {
            path,
            size: metadata.len(),
            mtime,
        })
    }
}

pub struct AnalysisEngine {
    config: EngineConfig,
    cache: Option<ResultCache>,
}

impl AnalysisEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cache = match &config.cache_dir {
            Some(dir) => Some(ResultCache::open(dir, config.cache_max_entries)?),
            None => None,
        };
        Ok(Self { config, cache })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resolve a selection against the registry; unknown names are an error
    pub fn select(&self, registry: &Registry, selection: &Selection) -> Result<Vec<Arc<dyn Analyzer>>> {
        for name in &selection.exclude {
            if !registry.contains(name) {
                return Err(Error::analyzer_not_found(name));
            }
        }
        let chosen = match &selection.names {
            Some(names) => registry.get_by_names(names)?,
            None => registry.list_all(true, None),
        };

        let mut seen = std::collections::BTreeSet::new();
        Ok(chosen
            .into_iter()
            .filter(|a| !selection.exclude.contains(&a.descriptor().name))
            .filter(|a| seen.insert(a.descriptor().name.clone()))
            .collect())
    }

    /// Analyze `path` with the selected analyzers from `registry`
    pub fn run(&self, registry: &Registry, path: &Path, selection: &Selection) -> Result<Snapshot> {
        let target = Target::resolve(path)?;
        let analyzers = self.select(registry, selection)?;
        Ok(self.execute_all(&target, &analyzers))
    }

    /// Analyze `path` with an explicit analyzer list, in the given order
    pub fn run_analyzers(&self, path: &Path, analyzers: &[Arc<dyn Analyzer>]) -> Result<Snapshot> {
        let target = Target::resolve(path)?;
        Ok(self.execute_all(&target, analyzers))
    }

    fn execute_all(&self, target: &Target, analyzers: &[Arc<dyn Analyzer>]) -> Snapshot {
        let file_type = detect_file_type(&target.path);
        let mut snapshot = Snapshot::new(
            target.path.to_string_lossy(),
            target.size,
            target.mtime,
            file_type.as_str(),
        );

        let (concurrent, sequential): (Vec<_>, Vec<_>) = analyzers
            .iter()
            .cloned()
            .partition(|a| a.descriptor().concurrent_safe());
        for analyzer in analyzers {
            trace!(analyzer = %analyzer.descriptor().name, state = %AnalyzerState::Pending);
        }

        info!(
            path = %target.path.display(),
            concurrent = concurrent.len(),
            sequential = sequential.len(),
            "Analyzing"
        );
        let started = Instant::now();
        let stop = AtomicBool::new(false);

        for outcome in self.run_concurrent(target, &concurrent, &stop) {
            record(&mut snapshot, outcome);
        }
        for analyzer in &sequential {
            if let Some(outcome) = self.execute(analyzer.as_ref(), target, &stop) {
                record(&mut snapshot, outcome);
            }
        }

        let (ok, failed, skipped) = snapshot.tally();
        info!(
            path = %target.path.display(),
            succeeded = ok,
            failed,
            skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Analysis complete"
        );
        snapshot
    }

    fn run_concurrent(
        &self,
        target: &Target,
        analyzers: &[Arc<dyn Analyzer>],
        stop: &AtomicBool,
    ) -> Vec<AnalysisOutcome> {
        if analyzers.is_empty() {
            return Vec::new();
        }
        let workers = self.config.max_concurrency.min(analyzers.len());
        let pool = if workers > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("Cannot start worker pool, running sequentially: {}", e);
                    None
                }
            }
        } else {
            None
        };

        match pool {
            Some(pool) => pool.install(|| {
                analyzers
                    .par_iter()
                    .filter_map(|a| self.execute(a.as_ref(), target, stop))
                    .collect()
            }),
            None => analyzers
                .iter()
                .filter_map(|a| self.execute(a.as_ref(), target, stop))
                .collect(),
        }
    }

    /// Drive one analyzer through its states; None when it was never launched
    fn execute(&self, analyzer: &dyn Analyzer, target: &Target, stop: &AtomicBool) -> Option<AnalysisOutcome> {
        let descriptor = analyzer.descriptor();
        let name = descriptor.name.as_str();
        if stop.load(Ordering::SeqCst) {
            debug!(analyzer = name, "Not launched after earlier failure");
            return None;
        }

        trace!(analyzer = name, state = %AnalyzerState::Checking);
        let started = Instant::now();
        let missing = match panic::catch_unwind(AssertUnwindSafe(|| analyzer.check_requirements())) {
            Ok(missing) => missing,
            Err(payload) => {
                let outcome = AnalysisOutcome::failure(
                    name,
                    format!("requirement check panicked: {}", panic_message(payload.as_ref())),
                );
                warn!(analyzer = name, state = %AnalyzerState::Failed, "Requirement check panicked");
                if self.config.fail_fast {
                    stop.store(true, Ordering::SeqCst);
                }
                return Some(finish(outcome, AnalyzerState::Failed, &descriptor.version, started));
            }
        };
        if !missing.is_empty() {
            debug!(analyzer = name, state = %AnalyzerState::Skipped, ?missing);
            return Some(finish(
                AnalysisOutcome::skipped(name, &missing),
                AnalyzerState::Skipped,
                descriptor.version.as_str(),
                started,
            ));
        }

        let cache_key = self.cache.as_ref().map(|_| {
            ResultCache::key(
                &target.path,
                target.mtime,
                target.size,
                name,
                &descriptor.version,
                &self.config.options,
            )
        });
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(outcome) = cache.load(key, name) {
                debug!(analyzer = name, state = %AnalyzerState::Succeeded, "Cached result");
                return Some(finish(
                    outcome.with_metadata(meta::CACHE_HIT, true),
                    AnalyzerState::Succeeded,
                    &descriptor.version,
                    started,
                ));
            }
        }

        debug!(analyzer = name, state = %AnalyzerState::Running);
        let options = &self.config.options;
        let mut outcome = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&target.path, options)))
            .unwrap_or_else(|payload| {
                AnalysisOutcome::failure(name, format!("analyzer panicked: {}", panic_message(payload.as_ref())))
            });
        outcome.analyzer = name.to_string();

        let state = if outcome.success {
            AnalyzerState::Succeeded
        } else {
            AnalyzerState::Failed
        };
        match state {
            AnalyzerState::Failed => {
                warn!(
                    analyzer = name,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "Analyzer failed"
                );
                if self.config.fail_fast {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            _ if outcome.truncated => {
                debug!(analyzer = name, state = %state, "Truncated result not cached");
            }
            _ => {
                if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                    if let Err(e) = cache.store(key, &outcome) {
                        warn!(analyzer = name, "Cannot cache result: {}", e);
                    }
                }
                debug!(analyzer = name, state = %state);
            }
        }

        Some(finish(outcome, state, &descriptor.version, started))
    }
}

fn finish(outcome: AnalysisOutcome, state: AnalyzerState, version: &str, started: Instant) -> AnalysisOutcome {
    outcome
        .with_metadata(meta::DURATION_MS, started.elapsed().as_millis() as u64)
        .with_metadata(meta::STATE, state.as_str())
        .with_metadata(meta::ANALYZER_VERSION, version)
}

fn record(snapshot: &mut Snapshot, outcome: AnalysisOutcome) {
    trace!(analyzer = %outcome.analyzer, state = %AnalyzerState::Recorded);
    snapshot.insert(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::AnalyzerDescriptor;
    use serde_json::Map;

    struct Named(AnalyzerDescriptor);

    impl Analyzer for Named {
        fn descriptor(&self) -> &AnalyzerDescriptor {
            &self.0
        }
        fn analyze(&self, _: &Path, _: &crate::config::AnalyzerOptions) -> AnalysisOutcome {
            AnalysisOutcome::success(self.0.name.clone(), Map::new())
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        for (name, priority, enabled) in [("a", 1, true), ("b", 2, true), ("c", 3, false)] {
            let descriptor = AnalyzerDescriptor::new(name, name)
                .priority(priority)
                .default_enabled(enabled);
            registry.register(Arc::new(Named(descriptor)), false).unwrap();
        }
        registry
    }

    fn names(analyzers: &[Arc<dyn Analyzer>]) -> Vec<String> {
        analyzers.iter().map(|a| a.descriptor().name.clone()).collect()
    }

    #[test]
    fn test_select_enabled_minus_excluded() {
        let engine = AnalysisEngine::new(EngineConfig::default()).unwrap();
        let registry = registry();
        assert_eq!(names(&engine.select(&registry, &Selection::all_enabled()).unwrap()), vec!["a", "b"]);
        let selection = Selection::all_enabled().excluding(["a"]);
        assert_eq!(names(&engine.select(&registry, &selection).unwrap()), vec!["b"]);
    }

    #[test]
    fn test_select_explicit_names() {
        let engine = AnalysisEngine::new(EngineConfig::default()).unwrap();
        let registry = registry();
        let picked = engine.select(&registry, &Selection::only(["c", "a", "c"])).unwrap();
        assert_eq!(names(&picked), vec!["c", "a"]);
    }

    #[test]
    fn test_select_unknown_name_fails() {
        let engine = AnalysisEngine::new(EngineConfig::default()).unwrap();
        let registry = registry();
        assert!(matches!(
            engine.select(&registry, &Selection::only(["a", "zzz"])),
            Err(Error::AnalyzerNotFound { .. })
        ));
        assert!(engine
            .select(&registry, &Selection::all_enabled().excluding(["zzz"]))
            .is_err());
    }

    #[test]
    fn test_missing_target() {
        let engine = AnalysisEngine::new(EngineConfig::default()).unwrap();
        let err = engine
            .run(&registry(), Path::new("/no/such/object.o"), &Selection::all_enabled())
            .unwrap_err();
        assert!(matches!(err, Error::TargetNotFound { .. }));
    }

    #[test]
    fn test_directory_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AnalysisEngine::new(EngineConfig::default()).unwrap();
        let err = engine.run(&registry(), dir.path(), &Selection::all_enabled()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(AnalysisEngine::new(config).is_err());
    }
}
