//! Snapshot data model.
//!
//! A `Snapshot` is the persisted result of one engine run over one file. The
//! JSON field names are the stable schema other snapshot versions are compared
//! against; `version` carries the schema version.

use crate::compare::DiffStatus;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const SCHEMA_VERSION: &str = "1.0";

/// Well-known metadata keys
pub mod meta {
    pub const SKIPPED: &str = "skipped";
    pub const DURATION_MS: &str = "duration_ms";
    pub const STATE: &str = "state";
    pub const BYTES_READ: &str = "bytes_read";
    pub const LINES: &str = "lines";
    pub const EXIT_CODE: &str = "exit_code";
    pub const TIMED_OUT: &str = "timed_out";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const ANALYZER_VERSION: &str = "analyzer_version";
    pub const SPILLED: &str = "spilled";
}

/// Result of one analyzer against one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    /// Filled from the key of the snapshot's `results` map
    #[serde(skip)]
    pub analyzer: String,
    pub success: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub truncated: bool,
}

impl AnalysisOutcome {
    pub fn success(analyzer: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            analyzer: analyzer.into(),
            success: true,
            data,
            raw_output: None,
            error: None,
            metadata: BTreeMap::new(),
            truncated: false,
        }
    }

    /// A failed outcome; `success` is always false when an error is present
    pub fn failure(analyzer: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            analyzer: analyzer.into(),
            success: false,
            data: Map::new(),
            raw_output: None,
            error: Some(error.into()),
            metadata: BTreeMap::new(),
            truncated: false,
        }
    }

    /// Outcome for an analyzer whose external tools are missing
    pub fn skipped(analyzer: impl Into<String>, missing: &[String]) -> Self {
        Self::failure(analyzer, format!("missing commands: {}", missing.join(", ")))
            .with_metadata(meta::SKIPPED, true)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// Keep raw output only when it is below `limit` bytes
    pub fn with_raw_output(mut self, raw: String, limit: usize) -> Self {
        if raw.len() <= limit {
            self.raw_output = Some(raw);
        }
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.metadata
            .get(meta::SKIPPED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.metadata.get(meta::DURATION_MS).and_then(Value::as_u64)
    }
}

/// The unit of persisted analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SnapshotDocument")]
pub struct Snapshot {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub filepath: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    #[serde(with = "timestamp")]
    pub file_mtime: DateTime<Utc>,
    pub file_type: String,
    pub results: BTreeMap<String, AnalysisOutcome>,
}

/// Wire form; older documents may lack `file_type` and per-result fields
#[derive(Deserialize)]
struct SnapshotDocument {
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    name: Option<String>,
    filepath: String,
    #[serde(with = "timestamp")]
    timestamp: DateTime<Utc>,
    file_size: u64,
    #[serde(with = "timestamp")]
    file_mtime: DateTime<Utc>,
    #[serde(default = "default_file_type")]
    file_type: String,
    #[serde(default)]
    results: BTreeMap<String, AnalysisOutcome>,
}

fn default_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_file_type() -> String {
    "unknown".to_string()
}

impl From<SnapshotDocument> for Snapshot {
    fn from(doc: SnapshotDocument) -> Self {
        let results = doc
            .results
            .into_iter()
            .map(|(name, mut outcome)| {
                outcome.analyzer = name.clone();
                (name, outcome)
            })
            .collect();
        Self {
            version: doc.version,
            name: doc.name,
            filepath: doc.filepath,
            timestamp: doc.timestamp,
            file_size: doc.file_size,
            file_mtime: doc.file_mtime,
            file_type: doc.file_type,
            results,
        }
    }
}

impl Snapshot {
    pub fn new(
        filepath: impl Into<String>,
        file_size: u64,
        file_mtime: DateTime<Utc>,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            name: None,
            filepath: filepath.into(),
            timestamp: Utc::now(),
            file_size,
            file_mtime,
            file_type: file_type.into(),
            results: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, outcome: AnalysisOutcome) {
        self.results.insert(outcome.analyzer.clone(), outcome);
    }

    pub fn outcome(&self, analyzer: &str) -> Option<&AnalysisOutcome> {
        self.results.get(analyzer)
    }

    /// (succeeded, failed, skipped)
    pub fn tally(&self) -> (usize, usize, usize) {
        self.results.values().fold((0, 0, 0), |(ok, failed, skipped), r| {
            if r.success {
                (ok + 1, failed, skipped)
            } else if r.is_skipped() {
                (ok, failed, skipped + 1)
            } else {
                (ok, failed + 1, skipped)
            }
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// One structured difference inside a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    pub status: DiffStatus,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

impl Difference {
    pub fn added(key: impl Into<String>, new: Value) -> Self {
        Self {
            status: DiffStatus::Added,
            key: key.into(),
            old: None,
            new: Some(new),
        }
    }

    pub fn removed(key: impl Into<String>, old: Value) -> Self {
        Self {
            status: DiffStatus::Removed,
            key: key.into(),
            old: Some(old),
            new: None,
        }
    }

    pub fn modified(key: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            status: DiffStatus::Modified,
            key: key.into(),
            old: Some(old),
            new: Some(new),
        }
    }
}

/// Result of comparing two outcomes of the same analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    pub analyzer: String,
    pub has_differences: bool,
    pub summary: String,
    pub differences: Vec<Difference>,
    pub statistics: BTreeMap<String, u64>,
}

impl ComparisonOutcome {
    /// Build from collected differences; the summary reads `+added -removed ~modified`
    pub fn from_differences(
        analyzer: impl Into<String>,
        differences: Vec<Difference>,
        unchanged: u64,
    ) -> Self {
        let mut statistics = BTreeMap::from([
            ("added".to_string(), 0),
            ("removed".to_string(), 0),
            ("modified".to_string(), 0),
            ("unchanged".to_string(), unchanged),
        ]);
        for diff in &differences {
            if let Some(count) = statistics.get_mut(diff.status.as_str()) {
                *count += 1;
            }
        }
        let has_differences = !differences.is_empty();
        let summary = if has_differences {
            let mut parts = vec![format!("+{} -{}", statistics["added"], statistics["removed"])];
            if statistics["modified"] > 0 {
                parts.push(format!("~{}", statistics["modified"]));
            }
            parts.join(" ")
        } else {
            "no differences".to_string()
        };
        Self {
            analyzer: analyzer.into(),
            has_differences,
            summary,
            differences,
            statistics,
        }
    }

    /// Comparison where one side has no usable result
    pub fn status_only(analyzer: impl Into<String>, status: &str) -> Self {
        Self {
            analyzer: analyzer.into(),
            has_differences: true,
            summary: status.to_string(),
            differences: Vec::new(),
            statistics: BTreeMap::new(),
        }
    }

    pub fn count(&self, counter: &str) -> u64 {
        self.statistics.get(counter).copied().unwrap_or(0)
    }
}

/// RFC 3339 on output; also accepts the offset-less ISO timestamps of older snapshots
mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(serde::de::Error::custom)?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
            .ok_or_else(|| serde::de::Error::custom(format!("nonexistent local time: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_snapshot() -> Snapshot {
        let mtime = DateTime::parse_from_rfc3339("2025-03-01T08:15:30.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut snapshot = Snapshot::new("/QOpenSys/usr/bin/runpase", 48213, mtime, "xcoff64");

        let mut data = Map::new();
        data.insert("strings".into(), json!([{"text": "runpase.c 1.4"}]));
        data.insert("count".into(), json!(1));
        snapshot.insert(
            AnalysisOutcome::success("what", data)
                .with_metadata(meta::DURATION_MS, 12)
                .with_metadata(meta::BYTES_READ, 128),
        );
        snapshot.insert(AnalysisOutcome::skipped("dump-h", &["dump".to_string()]));
        snapshot.insert(
            AnalysisOutcome::failure("dump-T", "Timeout after 300s")
                .with_metadata(meta::TIMED_OUT, true)
                .with_truncated(true),
        );
        snapshot
    }

    #[test]
    fn test_json_round_trip() {
        let snapshot = sample_snapshot();
        let json = snapshot.to_json().unwrap();
        let parsed = Snapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
        assert_eq!(parsed.results["what"].analyzer, "what");
    }

    #[test]
    fn test_json_uses_stable_field_names() {
        let value: Value = serde_json::from_str(&sample_snapshot().to_json().unwrap()).unwrap();
        for key in ["version", "filepath", "timestamp", "file_size", "file_mtime", "results"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        let what = &value["results"]["what"];
        for key in ["success", "data", "raw_output", "error", "metadata", "truncated"] {
            assert!(what.get(key).is_some(), "missing results.what.{}", key);
        }
        assert_eq!(value["version"], SCHEMA_VERSION);
    }

    #[test]
    fn test_parses_older_documents() {
        let json = r#"{
            "version": "1.0",
            "name": null,
            "filepath": "/usr/lib/libc.a",
            "timestamp": "2024-01-15T10:30:00.123456",
            "file_size": 100,
            "file_mtime": "2024-01-10T09:00:00",
            "results": {
                "what": {"success": true, "data": {"strings": ["a"], "count": 1}, "error": null, "truncated": false}
            }
        }"#;
        let snapshot = Snapshot::from_json(json).unwrap();
        assert_eq!(snapshot.file_type, "unknown");
        assert_eq!(snapshot.results["what"].analyzer, "what");
        assert!(snapshot.results["what"].metadata.is_empty());
        assert_eq!(snapshot.results["what"].raw_output, None);
    }

    #[test]
    fn test_failure_outcomes_never_succeed() {
        let outcome = AnalysisOutcome::failure("what", "boom");
        assert!(!outcome.success);
        let skipped = AnalysisOutcome::skipped("dump-h", &["dump".into(), "what".into()]);
        assert!(!skipped.success);
        assert!(skipped.is_skipped());
        assert_eq!(skipped.error.as_deref(), Some("missing commands: dump, what"));
    }

    #[test]
    fn test_raw_output_dropped_above_limit() {
        let outcome = AnalysisOutcome::success("dump-h", Map::new()).with_raw_output("x".repeat(20), 10);
        assert_eq!(outcome.raw_output, None);
        let outcome = AnalysisOutcome::success("dump-h", Map::new()).with_raw_output("x".repeat(5), 10);
        assert_eq!(outcome.raw_output.as_deref(), Some("xxxxx"));
    }

    #[test]
    fn test_tally() {
        assert_eq!(sample_snapshot().tally(), (1, 1, 1));
    }

    #[test]
    fn test_comparison_summary() {
        let diffs = vec![
            Difference::added("b", json!(2)),
            Difference::removed("c", json!(3)),
            Difference::modified("d", json!(1), json!(4)),
        ];
        let outcome = ComparisonOutcome::from_differences("x", diffs, 5);
        assert!(outcome.has_differences);
        assert_eq!(outcome.summary, "+1 -1 ~1");
        assert_eq!(outcome.count("unchanged"), 5);

        let same = ComparisonOutcome::from_differences("x", Vec::new(), 5);
        assert!(!same.has_differences);
        assert_eq!(same.summary, "no differences");
    }
}
