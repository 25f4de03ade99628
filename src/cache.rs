//! On-disk cache of successful analyzer outcomes.
//!
//! Entries are JSON files named by a SHA256 key over the target's path,
//! modification time and size, the analyzer name and version, and the
//! analyzer options that shape an outcome (output and line limits, object
//! mode, record cap, memory ceiling, sample size). Any change to the file,
//! the analyzer or those limits misses. Truncated outcomes are never stored
//! by the engine. Entries are written once,
//! atomically (temp file then rename), and evicted oldest-first once the
//! cache holds more than `max_entries`.

use crate::config::AnalyzerOptions;
use crate::error::{Error, Result};
use crate::snapshot::AnalysisOutcome;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    max_entries: usize,
}

impl ResultCache {
    /// Open (creating if needed) a cache rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>, max_entries: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::storage(format!("cannot create cache directory {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            max_entries: max_entries.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(
        path: &Path,
        mtime: DateTime<Utc>,
        size: u64,
        analyzer: &str,
        analyzer_version: &str,
        options: &AnalyzerOptions,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update([0]);
        hasher.update(mtime.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        hasher.update(size.to_be_bytes());
        hasher.update(analyzer.as_bytes());
        hasher.update([0]);
        hasher.update(analyzer_version.as_bytes());
        hasher.update([0]);
        // Timeout and scratch dir do not change a successful outcome
        hasher.update(options.max_output_bytes.to_be_bytes());
        hasher.update((options.max_line_length as u64).to_be_bytes());
        hasher.update(options.max_records.map_or(u64::MAX, |n| n as u64).to_be_bytes());
        hasher.update((options.memory_ceiling as u64).to_be_bytes());
        hasher.update((options.sample_size as u64).to_be_bytes());
        hasher.update((options.raw_output_limit as u64).to_be_bytes());
        hasher.update(options.object_mode.flag().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ENTRY_EXTENSION))
    }

    /// Cached outcome for `analyzer`, if present and readable
    pub fn load(&self, key: &str, analyzer: &str) -> Option<AnalysisOutcome> {
        let path = self.entry_path(key);
        let json = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<AnalysisOutcome>(&json) {
            Ok(mut outcome) => {
                outcome.analyzer = analyzer.to_string();
                trace!(analyzer, key, "Cache hit");
                Some(outcome)
            }
            Err(e) => {
                debug!("Discarding unreadable cache entry {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Write an entry; an existing entry for the same key is left untouched
    pub fn store(&self, key: &str, outcome: &AnalysisOutcome) -> Result<()> {
        let path = self.entry_path(key);
        if path.exists() {
            return Ok(());
        }

        let json = serde_json::to_vec(outcome)?;
        let mut temp = NamedTempFile::with_prefix_in(".entry-", &self.dir)
            .map_err(|e| Error::storage(format!("cannot create cache entry: {}", e)))?;
        temp.write_all(&json)
            .map_err(|e| Error::storage(format!("cannot write cache entry: {}", e)))?;
        temp.persist(&path)
            .map_err(|e| Error::storage(format!("cannot persist cache entry: {}", e.error)))?;

        self.evict()
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Vec<(SystemTime, PathBuf)> {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|e| e == ENTRY_EXTENSION))
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect()
    }

    fn evict(&self) -> Result<()> {
        let mut entries = self.entries();
        if entries.len() <= self.max_entries {
            return Ok(());
        }
        entries.sort();
        let excess = entries.len() - self.max_entries;
        for (_, path) in entries.into_iter().take(excess) {
            trace!("Evicting cache entry {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                // Another process may have evicted it already
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(Error::storage(format!(
                        "cannot evict {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        debug!(evicted = excess, "Cache over capacity");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectMode;
    use crate::snapshot::meta;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn outcome() -> AnalysisOutcome {
        let mut data = Map::new();
        data.insert("count".into(), json!(3));
        AnalysisOutcome::success("what", data).with_metadata(meta::BYTES_READ, 42)
    }

    #[test]
    fn test_key_changes_with_inputs() {
        let mtime = Utc::now();
        let opts = AnalyzerOptions::default();
        let key = |path: &str, mtime, size, name: &str, version: &str| {
            ResultCache::key(Path::new(path), mtime, size, name, version, &opts)
        };
        let base = key("/a.o", mtime, 10, "what", "1.0");
        assert_eq!(base, key("/a.o", mtime, 10, "what", "1.0"));
        assert_ne!(base, key("/b.o", mtime, 10, "what", "1.0"));
        assert_ne!(base, key("/a.o", mtime, 11, "what", "1.0"));
        assert_ne!(base, key("/a.o", mtime, 10, "dump-h", "1.0"));
        assert_ne!(base, key("/a.o", mtime, 10, "what", "1.1"));
        assert_ne!(base, key("/a.o", mtime + chrono::Duration::seconds(1), 10, "what", "1.0"));
    }

    #[test]
    fn test_key_changes_with_output_limits() {
        let mtime = Utc::now();
        let path = Path::new("/usr/lib/libc.a");
        let key = |opts: &AnalyzerOptions| ResultCache::key(path, mtime, 10, "dump-h", "1.0", opts);
        let defaults = AnalyzerOptions::default();
        let base = key(&defaults);

        let variants = [
            AnalyzerOptions { max_output_bytes: 100, ..defaults.clone() },
            AnalyzerOptions { max_line_length: 80, ..defaults.clone() },
            AnalyzerOptions { max_records: Some(10), ..defaults.clone() },
            AnalyzerOptions { memory_ceiling: 1024, ..defaults.clone() },
            AnalyzerOptions { sample_size: 7, ..defaults.clone() },
            AnalyzerOptions { raw_output_limit: 0, ..defaults.clone() },
            AnalyzerOptions { object_mode: ObjectMode::Bits64, ..defaults.clone() },
        ];
        for variant in &variants {
            assert_ne!(base, key(variant), "{:?}", variant);
        }

        // Limits that only decide success or failure keep the key
        let slower = AnalyzerOptions {
            timeout: Duration::from_secs(5),
            ..defaults.clone()
        };
        assert_eq!(base, key(&slower));
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 8).unwrap();
        assert!(cache.load("abc", "what").is_none());

        cache.store("abc", &outcome()).unwrap();
        let loaded = cache.load("abc", "what").unwrap();
        assert_eq!(loaded, outcome());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 8).unwrap();
        fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(cache.load("bad", "what").is_none());
        assert!(!dir.path().join("bad.json").exists());
    }

    #[test]
    fn test_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path(), 2).unwrap();
        for key in ["first", "second", "third"] {
            cache.store(key, &outcome()).unwrap();
            // Distinct modification times
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.load("first", "what").is_none());
        assert!(cache.load("third", "what").is_some());
    }
}
