//! Analyzer registry.
//!
//! Holds analyzers by unique name and hands them out ordered by priority.
//! A process-wide instance is managed with `initialize`, `global` and
//! `shutdown`; code that wants isolation (tests, embedding) builds its own
//! `Registry` instead.

use crate::analyzers::command::{CommandManifest, ExternalCommandAnalyzer};
use crate::analyzers::{builtin_analyzers, Analyzer, AnalyzerDescriptor, Capability};
use crate::error::{Error, Result};
use parking_lot::{
    const_rwlock, MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Overrides applied on top of each analyzer's default-enabled flag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnablePolicy {
    pub enable: BTreeSet<String>,
    pub disable: BTreeSet<String>,
    /// Only analyzers named in `enable` count as enabled
    pub ignore_defaults: bool,
}

impl EnablePolicy {
    pub fn is_enabled(&self, descriptor: &AnalyzerDescriptor) -> bool {
        if self.disable.contains(&descriptor.name) {
            return false;
        }
        if self.enable.contains(&descriptor.name) {
            return true;
        }
        !self.ignore_defaults && descriptor.default_enabled
    }
}

/// Entry point of a compiled-in plugin
pub type PluginEntry = fn(&mut PluginRegistrar) -> Result<()>;

/// Collects the analyzers a plugin entry point offers
#[derive(Default)]
pub struct PluginRegistrar {
    analyzers: Vec<Arc<dyn Analyzer>>,
}

impl PluginRegistrar {
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.push(analyzer);
    }
}

/// Outcome of loading manifests; one bad manifest never stops the others
#[derive(Debug, Default)]
pub struct PluginLoadReport {
    pub loaded: Vec<String>,
    pub errors: Vec<(PathBuf, String)>,
}

impl PluginLoadReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Default)]
pub struct Registry {
    analyzers: BTreeMap<String, Arc<dyn Analyzer>>,
    policy: EnablePolicy,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in analyzers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for analyzer in builtin_analyzers() {
            let name = analyzer.descriptor().name.clone();
            registry.analyzers.insert(name, analyzer);
        }
        registry
    }

    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>, allow_replace: bool) -> Result<()> {
        let name = analyzer.descriptor().name.clone();
        if self.analyzers.contains_key(&name) {
            if !allow_replace {
                return Err(Error::duplicate_analyzer(name));
            }
            debug!(analyzer = %name, "Replacing registered analyzer");
        }
        self.analyzers.insert(name, analyzer);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Analyzer>> {
        self.analyzers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::analyzer_not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.analyzers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    pub fn policy(&self) -> &EnablePolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: EnablePolicy) {
        self.policy = policy;
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.analyzers
            .get(name)
            .is_some_and(|a| self.policy.is_enabled(a.descriptor()))
    }

    /// Analyzers in ascending priority (name breaks ties), optionally filtered
    pub fn list_all(&self, enabled_only: bool, capability: Option<Capability>) -> Vec<Arc<dyn Analyzer>> {
        let mut selected: Vec<Arc<dyn Analyzer>> = self
            .analyzers
            .values()
            .filter(|a| !enabled_only || self.policy.is_enabled(a.descriptor()))
            .filter(|a| capability.map_or(true, |c| a.descriptor().has(c)))
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            let (a, b) = (a.descriptor(), b.descriptor());
            a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name))
        });
        selected
    }

    /// Analyzers in the caller's order; any unknown name fails the whole lookup
    pub fn get_by_names<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn Analyzer>>> {
        names.iter().map(|name| self.get(name.as_ref())).collect()
    }

    /// Register manifest-described analyzers from a file or a directory of `*.yaml`/`*.yml`.
    pub fn load_external(&mut self, path: &Path) -> PluginLoadReport {
        let mut report = PluginLoadReport::default();

        let manifests: Vec<PathBuf> = if path.is_dir() {
            let mut files: Vec<PathBuf> = WalkDir::new(path)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|entry| entry.into_path())
                .filter(|p| p.is_file() && is_manifest(p))
                .collect();
            files.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));
            files
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            report
                .errors
                .push((path.to_path_buf(), "no such file or directory".to_string()));
            return report;
        };

        for manifest_path in manifests {
            match self.load_manifest(&manifest_path) {
                Ok(name) => {
                    debug!(analyzer = %name, path = %manifest_path.display(), "Loaded plugin manifest");
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!("Skipping plugin manifest {}: {}", manifest_path.display(), e);
                    report.errors.push((manifest_path, e.to_string()));
                }
            }
        }

        if !report.loaded.is_empty() {
            info!("Loaded {} plugin analyzer(s) from {}", report.loaded.len(), path.display());
        }
        report
    }

    fn load_manifest(&mut self, path: &Path) -> Result<String> {
        let source = path.display().to_string();
        let yaml = std::fs::read_to_string(path).map_err(|e| Error::plugin_load(&source, e.to_string()))?;
        let manifest =
            CommandManifest::from_yaml(&yaml).map_err(|e| Error::plugin_load(&source, e.to_string()))?;
        let analyzer = ExternalCommandAnalyzer::from_manifest(manifest)?;
        let name = analyzer.descriptor().name.clone();
        self.register(Arc::new(analyzer), false)?;
        Ok(name)
    }

    /// Run a plugin entry point once and register what it offers.
    ///
    /// A panicking or failing entry point registers nothing. Returns the
    /// number of analyzers added.
    pub fn load_plugin(&mut self, name: &str, entry: PluginEntry) -> Result<usize> {
        let mut registrar = PluginRegistrar::default();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry(&mut registrar)));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::plugin_load(name, e.to_string())),
            Err(payload) => {
                return Err(Error::plugin_load(
                    name,
                    format!("entry point panicked: {}", panic_message(payload.as_ref())),
                ))
            }
        }

        let mut offered_names = HashSet::new();
        for analyzer in &registrar.analyzers {
            let offered = &analyzer.descriptor().name;
            if self.analyzers.contains_key(offered) || !offered_names.insert(offered.as_str()) {
                return Err(Error::plugin_load(name, Error::duplicate_analyzer(offered).to_string()));
            }
        }
        let count = registrar.analyzers.len();
        for analyzer in registrar.analyzers {
            self.register(analyzer, false)?;
        }
        debug!(plugin = name, count, "Plugin loaded");
        Ok(count)
    }
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml")
}

/// Text of a panic payload, when it carries one
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

static GLOBAL: RwLock<Option<Registry>> = const_rwlock(None);

/// Create the process-wide registry with the built-in analyzers. Idempotent.
pub fn initialize() {
    let mut global = GLOBAL.write();
    if global.is_none() {
        *global = Some(Registry::with_builtins());
        debug!("Analyzer registry initialized");
    }
}

/// Shared access to the process-wide registry
pub fn global() -> Result<MappedRwLockReadGuard<'static, Registry>> {
    RwLockReadGuard::try_map(GLOBAL.read(), Option::as_ref).map_err(|_| Error::RegistryNotInitialized)
}

/// Exclusive access to the process-wide registry, for plugin loading
pub fn global_mut() -> Result<MappedRwLockWriteGuard<'static, Registry>> {
    RwLockWriteGuard::try_map(GLOBAL.write(), Option::as_mut).map_err(|_| Error::RegistryNotInitialized)
}

/// Drop the process-wide registry; `initialize` may be called again afterwards
pub fn shutdown() {
    GLOBAL.write().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerOptions;
    use crate::snapshot::AnalysisOutcome;
    use serde_json::Map;

    struct Fixed(AnalyzerDescriptor);

    impl Analyzer for Fixed {
        fn descriptor(&self) -> &AnalyzerDescriptor {
            &self.0
        }
        fn analyze(&self, _: &Path, _: &AnalyzerOptions) -> AnalysisOutcome {
            AnalysisOutcome::success(self.0.name.clone(), Map::new())
        }
    }

    fn fixed(name: &str, priority: i32) -> Arc<dyn Analyzer> {
        Arc::new(Fixed(AnalyzerDescriptor::new(name, name).priority(priority)))
    }

    fn names(analyzers: &[Arc<dyn Analyzer>]) -> Vec<String> {
        analyzers.iter().map(|a| a.descriptor().name.clone()).collect()
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = Registry::new();
        registry.register(fixed("a", 1), false).unwrap();
        let err = registry.register(fixed("a", 2), false).unwrap_err();
        assert!(matches!(err, Error::DuplicateAnalyzer { .. }));

        registry.register(fixed("a", 3), true).unwrap();
        assert_eq!(registry.get("a").unwrap().descriptor().priority, 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown() {
        let registry = Registry::with_builtins();
        assert!(matches!(registry.get("dump-Z"), Err(Error::AnalyzerNotFound { .. })));
    }

    #[test]
    fn test_list_all_orders_by_priority_then_name() {
        let mut registry = Registry::new();
        registry.register(fixed("zeta", 5), false).unwrap();
        registry.register(fixed("alpha", 5), false).unwrap();
        registry.register(fixed("first", 1), false).unwrap();
        assert_eq!(names(&registry.list_all(false, None)), vec!["first", "alpha", "zeta"]);
    }

    #[test]
    fn test_list_all_filters() {
        let mut registry = Registry::with_builtins();
        let enabled = names(&registry.list_all(true, None));
        assert_eq!(enabled, vec!["what", "dump-h", "dump-T", "ar-t"]);

        let concurrent = names(&registry.list_all(false, Some(Capability::ConcurrentSafe)));
        assert_eq!(concurrent, vec!["what", "dump-h", "ar-t"]);

        registry.set_policy(EnablePolicy {
            enable: BTreeSet::from(["dump-t".to_string()]),
            disable: BTreeSet::from(["what".to_string()]),
            ignore_defaults: false,
        });
        assert_eq!(
            names(&registry.list_all(true, None)),
            vec!["dump-h", "dump-T", "dump-t", "ar-t"]
        );

        registry.set_policy(EnablePolicy {
            enable: BTreeSet::from(["ar-t".to_string()]),
            ignore_defaults: true,
            ..Default::default()
        });
        assert_eq!(names(&registry.list_all(true, None)), vec!["ar-t"]);
    }

    #[test]
    fn test_get_by_names_keeps_caller_order() {
        let registry = Registry::with_builtins();
        let picked = registry.get_by_names(&["ar-t", "what"]).unwrap();
        assert_eq!(names(&picked), vec!["ar-t", "what"]);
        assert!(registry.get_by_names(&["what", "nope"]).is_err());
    }

    #[test]
    fn test_load_external_isolates_bad_manifests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), "name: strings\nprogram: strings\n").unwrap();
        std::fs::write(dir.path().join("bad.yml"), "name: [unterminated\n").unwrap();
        std::fs::write(dir.path().join("dup.yaml"), "name: what\nprogram: what\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = Registry::with_builtins();
        let report = registry.load_external(dir.path());
        assert_eq!(report.loaded, vec!["strings"]);
        assert_eq!(report.errors.len(), 2);
        assert!(registry.contains("strings"));
        assert!(registry.contains("what"));
    }

    #[test]
    fn test_load_external_missing_path() {
        let mut registry = Registry::new();
        let report = registry.load_external(Path::new("/no/such/plugins"));
        assert!(!report.is_clean());
    }

    fn good_plugin(registrar: &mut PluginRegistrar) -> Result<()> {
        registrar.register(fixed("plugin-a", 70));
        registrar.register(fixed("plugin-b", 71));
        Ok(())
    }

    fn panicking_plugin(_: &mut PluginRegistrar) -> Result<()> {
        panic!("plugin exploded");
    }

    fn colliding_plugin(registrar: &mut PluginRegistrar) -> Result<()> {
        registrar.register(fixed("plugin-c", 72));
        registrar.register(fixed("what", 1));
        Ok(())
    }

    fn self_colliding_plugin(registrar: &mut PluginRegistrar) -> Result<()> {
        registrar.register(fixed("plugin-d", 73));
        registrar.register(fixed("plugin-d", 74));
        Ok(())
    }

    #[test]
    fn test_plugin_offering_one_name_twice_registers_nothing() {
        let mut registry = Registry::with_builtins();
        let before = registry.len();
        let err = registry.load_plugin("twice", self_colliding_plugin).unwrap_err();
        assert!(err.to_string().contains("plugin-d"));
        assert!(!registry.contains("plugin-d"));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn test_load_plugin() {
        let mut registry = Registry::with_builtins();
        assert_eq!(registry.load_plugin("good", good_plugin).unwrap(), 2);
        assert!(registry.contains("plugin-b"));

        let err = registry.load_plugin("boom", panicking_plugin).unwrap_err();
        assert!(err.to_string().contains("plugin exploded"));

        assert!(registry.load_plugin("collide", colliding_plugin).is_err());
        assert!(!registry.contains("plugin-c"));
        // Built-ins survive a failing plugin
        assert_eq!(registry.get("what").unwrap().descriptor().priority, 10);
    }
}
