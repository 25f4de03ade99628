//! Analyzer options, engine configuration, and the optional YAML config file.
//!
//! Values resolve in this order: built-in defaults, then the config file
//! (`--config` or `<config dir>/xcoffscan/config.yaml`), then CLI flags.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 64 * 1024 * 1024; // 64MB
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;
pub const DEFAULT_MEMORY_CEILING: usize = 32 * 1024 * 1024; // 32MB
pub const DEFAULT_SAMPLE_SIZE: usize = 100;
pub const DEFAULT_RAW_OUTPUT_LIMIT: usize = 16 * 1024;
pub const DEFAULT_CACHE_ENTRIES: usize = 512;

/// Object mode passed to AIX tools as `-X<mode>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectMode {
    #[serde(rename = "32")]
    Bits32,
    #[serde(rename = "64")]
    Bits64,
    #[default]
    #[serde(rename = "32_64")]
    Any,
}

impl ObjectMode {
    /// The `-X` flag understood by `dump` and `ar`
    pub fn flag(&self) -> &'static str {
        match self {
            ObjectMode::Bits32 => "-X32",
            ObjectMode::Bits64 => "-X64",
            ObjectMode::Any => "-X32_64",
        }
    }
}

/// Per-invocation limits handed to every analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerOptions {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_output_bytes: u64,
    pub max_line_length: usize,
    /// Cap on structured records kept per analyzer (None = bounded only by memory)
    pub max_records: Option<usize>,
    /// Scratch directory for accumulator spill files (None = system temp dir)
    pub scratch_dir: Option<PathBuf>,
    pub memory_ceiling: usize,
    pub sample_size: usize,
    /// Raw output is kept in the outcome only below this size
    pub raw_output_limit: usize,
    pub object_mode: ObjectMode,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_records: None,
            scratch_dir: None,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            sample_size: DEFAULT_SAMPLE_SIZE,
            raw_output_limit: DEFAULT_RAW_OUTPUT_LIMIT,
            object_mode: ObjectMode::default(),
        }
    }
}

impl AnalyzerOptions {
    /// Validate the options and return errors for unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::configuration("timeout must be greater than 0"));
        }
        if self.max_output_bytes == 0 {
            return Err(Error::configuration("max_output_bytes must be greater than 0"));
        }
        if self.max_line_length == 0 {
            return Err(Error::configuration("max_line_length must be greater than 0"));
        }
        if self.memory_ceiling == 0 {
            return Err(Error::configuration("memory_ceiling must be greater than 0"));
        }
        if let Some(dir) = &self.scratch_dir {
            if !dir.is_dir() {
                return Err(Error::configuration(format!(
                    "scratch_dir is not a directory: {}",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Directory used for spill files
    pub fn spill_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub options: AnalyzerOptions,
    /// Worker pool size for the concurrent-safe batch
    pub max_concurrency: usize,
    /// Stop launching analyzers after the first failure
    pub fail_fast: bool,
    /// Result cache directory (None disables caching)
    pub cache_dir: Option<PathBuf>,
    pub cache_max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            options: AnalyzerOptions::default(),
            max_concurrency: std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1),
            fail_fast: false,
            cache_dir: None,
            cache_max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::configuration("max_concurrency must be greater than 0"));
        }
        if self.cache_dir.is_some() && self.cache_max_entries == 0 {
            return Err(Error::configuration("cache_max_entries must be greater than 0"));
        }
        self.options.validate()
    }
}

/// On-disk configuration file
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub options: Option<AnalyzerOptions>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub fail_fast: Option<bool>,
    /// Analyzers to enable even when they are off by default
    #[serde(default)]
    pub enable: BTreeSet<String>,
    /// Analyzers to disable even when they are on by default
    #[serde(default)]
    pub disable: BTreeSet<String>,
    /// Ignore the default-enabled flags entirely (only `enable` counts)
    #[serde(default)]
    pub ignore_defaults: bool,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

fn default_cache_entries() -> usize {
    DEFAULT_CACHE_ENTRIES
}

impl FileConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::configuration(e.to_string()))
    }

    /// Load an explicitly requested config file; any failure is an error
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Load the default config file if present, falling back to defaults
    pub fn load_default() -> Self {
        let Some(path) = default_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Fold the file settings into an engine configuration
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(options) = &self.options {
            config.options = options.clone();
        }
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
        if let Some(fail_fast) = self.fail_fast {
            config.fail_fast = fail_fast;
        }
        if self.cache.enabled {
            config.cache_dir = self
                .cache
                .dir
                .clone()
                .or_else(|| dirs::cache_dir().map(|d| d.join("xcoffscan")));
            config.cache_max_entries = self.cache.max_entries;
        }
    }
}

/// `<config dir>/xcoffscan/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("xcoffscan").join("config.yaml"))
}

/// Named-snapshot database location: explicit path, `$XCOFF_DB_PATH`, or `~/.xcoffscandb`
pub fn db_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var("XCOFF_DB_PATH") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".xcoffscandb"))
        .ok_or_else(|| Error::configuration("cannot determine home directory"))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
