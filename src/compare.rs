//! Streaming comparison of ordered record sequences, and snapshot-level
//! comparison built on top of it.
//!
//! `compare_sorted` walks two key-sorted sequences in a single merge pass and
//! reports each difference through a callback, so neither side is buffered.

use crate::config::AnalyzerOptions;
use crate::error::Result;
use crate::registry::Registry;
use crate::snapshot::{AnalysisOutcome, ComparisonOutcome, Difference, Snapshot};
use crate::store::SnapshotStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Added,
    Removed,
    Modified,
    Unchanged,
}

impl DiffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffStatus::Added => "added",
            DiffStatus::Removed => "removed",
            DiffStatus::Modified => "modified",
            DiffStatus::Unchanged => "unchanged",
        }
    }
}

/// One step of a sorted merge
#[derive(Debug, Clone, PartialEq)]
pub enum RecordDiff<T> {
    /// Only in the second sequence
    Added(T),
    /// Only in the first sequence
    Removed(T),
    /// Same key, different record
    Modified { old: T, new: T },
    Unchanged(T),
}

impl<T> RecordDiff<T> {
    pub fn status(&self) -> DiffStatus {
        match self {
            RecordDiff::Added(_) => DiffStatus::Added,
            RecordDiff::Removed(_) => DiffStatus::Removed,
            RecordDiff::Modified { .. } => DiffStatus::Modified,
            RecordDiff::Unchanged(_) => DiffStatus::Unchanged,
        }
    }
}

/// Counters for a finished merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: u64,
    pub removed: u64,
    pub modified: u64,
    pub unchanged: u64,
}

impl DiffStats {
    fn count(&mut self, status: DiffStatus) {
        match status {
            DiffStatus::Added => self.added += 1,
            DiffStatus::Removed => self.removed += 1,
            DiffStatus::Modified => self.modified += 1,
            DiffStatus::Unchanged => self.unchanged += 1,
        }
    }

    pub fn has_differences(&self) -> bool {
        self.added + self.removed + self.modified > 0
    }

    pub fn to_map(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("added".to_string(), self.added),
            ("removed".to_string(), self.removed),
            ("modified".to_string(), self.modified),
            ("unchanged".to_string(), self.unchanged),
        ])
    }
}

/// Merge two sequences sorted ascending by `key`, calling `on_diff` once per step.
///
/// Runs in O(n + m) time and holds one record from each side at a time. Input
/// that is not sorted produces an unspecified diff but never panics.
pub fn compare_sorted<T, K, I, J, F, C>(a: I, b: J, mut key: F, mut on_diff: C) -> DiffStats
where
    I: IntoIterator<Item = T>,
    J: IntoIterator<Item = T>,
    K: Ord,
    T: PartialEq,
    F: FnMut(&T) -> K,
    C: FnMut(RecordDiff<T>),
{
    let mut stats = DiffStats::default();
    let mut emit = |diff: RecordDiff<T>, stats: &mut DiffStats| {
        stats.count(diff.status());
        on_diff(diff);
    };

    let mut left = a.into_iter();
    let mut right = b.into_iter();
    let mut old = left.next();
    let mut new = right.next();

    loop {
        match (old.take(), new.take()) {
            (Some(o), Some(n)) => match key(&o).cmp(&key(&n)) {
                Ordering::Less => {
                    emit(RecordDiff::Removed(o), &mut stats);
                    old = left.next();
                    new = Some(n);
                }
                Ordering::Greater => {
                    emit(RecordDiff::Added(n), &mut stats);
                    old = Some(o);
                    new = right.next();
                }
                Ordering::Equal => {
                    if o == n {
                        emit(RecordDiff::Unchanged(o), &mut stats);
                    } else {
                        emit(RecordDiff::Modified { old: o, new: n }, &mut stats);
                    }
                    old = left.next();
                    new = right.next();
                }
            },
            (Some(o), None) => {
                emit(RecordDiff::Removed(o), &mut stats);
                old = left.next();
            }
            (None, Some(n)) => {
                emit(RecordDiff::Added(n), &mut stats);
                new = right.next();
            }
            (None, None) => break,
        }
    }

    stats
}

/// Compare two lists of JSON objects keyed by a string field.
///
/// Objects without the key field are ignored. Differences are named by key.
pub fn diff_keyed(analyzer: &str, old: &[Value], new: &[Value], key_field: &str) -> ComparisonOutcome {
    let keyed = |items: &[Value]| -> Vec<(String, Value)> {
        let mut rows: Vec<(String, Value)> = items
            .iter()
            .filter_map(|item| {
                let key = item.get(key_field)?.as_str()?.to_string();
                Some((key, item.clone()))
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    };

    let mut differences = Vec::new();
    let stats = compare_sorted(
        keyed(old),
        keyed(new),
        |(key, _)| key.clone(),
        |diff| push_difference(&mut differences, diff),
    );
    ComparisonOutcome::from_differences(analyzer, differences, stats.unchanged)
}

/// Compare two collections of strings as sets
pub fn diff_sets<'a, I, J>(analyzer: &str, old: I, new: J) -> ComparisonOutcome
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
{
    let old: BTreeSet<&str> = old.into_iter().collect();
    let new: BTreeSet<&str> = new.into_iter().collect();

    let mut differences = Vec::new();
    let stats = compare_sorted(
        old,
        new,
        |s| *s,
        |diff| match diff {
            RecordDiff::Added(s) => differences.push(Difference::added(s, Value::from(s))),
            RecordDiff::Removed(s) => differences.push(Difference::removed(s, Value::from(s))),
            _ => {}
        },
    );
    ComparisonOutcome::from_differences(analyzer, differences, stats.unchanged)
}

/// Structural diff of two `data` maps over their flattened leaf paths
pub fn diff_data(analyzer: &str, old: &Map<String, Value>, new: &Map<String, Value>) -> ComparisonOutcome {
    let mut differences = Vec::new();
    let stats = compare_sorted(
        flatten(old),
        flatten(new),
        |(path, _)| path.clone(),
        |diff| push_difference(&mut differences, diff),
    );
    ComparisonOutcome::from_differences(analyzer, differences, stats.unchanged)
}

fn push_difference(differences: &mut Vec<Difference>, diff: RecordDiff<(String, Value)>) {
    match diff {
        RecordDiff::Added((key, value)) => differences.push(Difference::added(key, value)),
        RecordDiff::Removed((key, value)) => differences.push(Difference::removed(key, value)),
        RecordDiff::Modified {
            old: (key, old),
            new: (_, new),
        } => differences.push(Difference::modified(key, old, new)),
        RecordDiff::Unchanged(_) => {}
    }
}

/// Leaf values of a JSON map as `(path, value)` sorted by path.
/// Paths look like `sections[2].name`.
pub fn flatten(data: &Map<String, Value>) -> Vec<(String, Value)> {
    fn walk(prefix: String, value: &Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(path, child, out);
                }
            }
            Value::Array(items) if !items.is_empty() => {
                for (i, child) in items.iter().enumerate() {
                    walk(format!("{}[{}]", prefix, i), child, out);
                }
            }
            leaf => out.push((prefix, leaf.clone())),
        }
    }

    let mut out = Vec::new();
    for (key, value) in data {
        walk(key.clone(), value, &mut out);
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Comparison of two whole snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotComparison {
    pub filepath1: String,
    pub filepath2: String,
    pub has_differences: bool,
    pub summary: String,
    /// File-level differences (size, type)
    pub metadata: Vec<Difference>,
    pub analyzers: BTreeMap<String, ComparisonOutcome>,
}

/// Compare `old` against `new`, analyzer by analyzer.
///
/// Analyzers present on one side only are reported with an `added` or
/// `removed` status. Analyzers that are no longer registered fall back to the
/// structural diff of their data.
pub fn compare_snapshots(
    registry: &Registry,
    old: &Snapshot,
    new: &Snapshot,
    options: &AnalyzerOptions,
) -> SnapshotComparison {
    let mut metadata = Vec::new();
    if old.file_size != new.file_size {
        metadata.push(Difference::modified(
            "file_size",
            Value::from(old.file_size),
            Value::from(new.file_size),
        ));
    }
    if old.file_type != new.file_type {
        metadata.push(Difference::modified(
            "file_type",
            Value::from(old.file_type.as_str()),
            Value::from(new.file_type.as_str()),
        ));
    }

    let names: BTreeSet<&String> = old.results.keys().chain(new.results.keys()).collect();
    let mut analyzers = BTreeMap::new();

    for name in names {
        let outcome = match (old.results.get(name), new.results.get(name)) {
            (None, Some(_)) => ComparisonOutcome::status_only(name.as_str(), "added"),
            (Some(_), None) => ComparisonOutcome::status_only(name.as_str(), "removed"),
            (Some(a), Some(b)) => match compare_outcomes(registry, name, a, b, options) {
                Some(outcome) => outcome,
                None => continue,
            },
            (None, None) => continue,
        };
        analyzers.insert(name.clone(), outcome);
    }

    let has_differences = !metadata.is_empty() || analyzers.values().any(|c| c.has_differences);
    let summary = build_summary(&metadata, &analyzers);

    SnapshotComparison {
        filepath1: old.filepath.clone(),
        filepath2: new.filepath.clone(),
        has_differences,
        summary,
        metadata,
        analyzers,
    }
}

fn compare_outcomes(
    registry: &Registry,
    name: &str,
    old: &AnalysisOutcome,
    new: &AnalysisOutcome,
    options: &AnalyzerOptions,
) -> Option<ComparisonOutcome> {
    match (old.success, new.success) {
        (true, true) => Some(match registry.get(name) {
            Ok(analyzer) => analyzer.compare(old, new, options),
            Err(_) => {
                debug!(analyzer = %name, "Analyzer not registered, using structural diff");
                diff_data(name, &old.data, &new.data)
            }
        }),
        (true, false) => Some(ComparisonOutcome::status_only(name, "now failing")),
        (false, true) => Some(ComparisonOutcome::status_only(name, "now succeeding")),
        // Nothing comparable on either side
        (false, false) => None,
    }
}

fn build_summary(metadata: &[Difference], analyzers: &BTreeMap<String, ComparisonOutcome>) -> String {
    let mut parts = Vec::new();
    if metadata.iter().any(|d| d.key == "file_size") {
        parts.push("file size changed".to_string());
    }
    if metadata.iter().any(|d| d.key == "file_type") {
        parts.push("file type changed".to_string());
    }
    for (name, outcome) in analyzers {
        if outcome.has_differences {
            parts.push(format!("{}: {}", name, outcome.summary));
        }
    }
    if parts.is_empty() {
        "No differences".to_string()
    } else {
        parts.join("; ")
    }
}

/// Comparison of two named snapshot sets, file by file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetComparison {
    pub snapshot1: String,
    pub snapshot2: String,
    /// Files stored in both sets whose snapshots differ
    pub changed: Vec<SnapshotComparison>,
    /// Files only in the second set
    pub added: Vec<String>,
    /// Files only in the first set
    pub removed: Vec<String>,
    pub unchanged: usize,
}

impl SetComparison {
    pub fn has_differences(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Compare every file stored in set `name1` against set `name2`
pub fn compare_sets(
    registry: &Registry,
    store: &SnapshotStore,
    name1: &str,
    name2: &str,
    options: &AnalyzerOptions,
) -> Result<SetComparison> {
    let files: BTreeSet<String> = store
        .list_files(name1)?
        .into_iter()
        .chain(store.list_files(name2)?)
        .collect();

    let mut result = SetComparison {
        snapshot1: name1.to_string(),
        snapshot2: name2.to_string(),
        changed: Vec::new(),
        added: Vec::new(),
        removed: Vec::new(),
        unchanged: 0,
    };
    for filepath in files {
        match (store.load(name1, &filepath)?, store.load(name2, &filepath)?) {
            (Some(old), Some(new)) => {
                let comparison = compare_snapshots(registry, &old, &new, options);
                if comparison.has_differences {
                    result.changed.push(comparison);
                } else {
                    result.unchanged += 1;
                }
            }
            (Some(_), None) => result.removed.push(filepath),
            (None, Some(_)) => result.added.push(filepath),
            (None, None) => {}
        }
    }
    debug!(
        set1 = name1,
        set2 = name2,
        changed = result.changed.len(),
        added = result.added.len(),
        removed = result.removed.len(),
        "Compared snapshot sets"
    );
    Ok(result)
}

/// Convenience for analyzers whose data holds one keyed list
pub(crate) fn list_field<'a>(data: &'a Map<String, Value>, field: &str) -> &'a [Value] {
    data.get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
