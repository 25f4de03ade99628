//! Output formatting.
//!
//! Every renderer supports three modes:
//! - `text`: human-readable, colored when stdout is a terminal
//! - `json`: one pretty-printed document
//! - `jsonl`: one compact JSON object per line, for streaming consumers

use crate::analyzers::AnalyzerDescriptor;
use crate::compare::{DiffStatus, SetComparison, SnapshotComparison};
use crate::error::Result;
use crate::snapshot::{AnalysisOutcome, Difference, Snapshot};
use crate::store::SnapshotSet;
use crate::validate::ValidationReport;
use colored::Colorize;
use serde::Serialize;
use serde_json::{json, Map, Value};

const RULE_WIDTH: usize = 60;
/// Items listed per group before eliding the rest
const LIST_LIMIT: usize = 20;
const DIFF_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable terminal output
    #[default]
    Text,
    /// JSON output for machine consumption
    Json,
    /// One JSON object per line
    Jsonl,
}

/// An analyzer as shown by the `analyzers` listing
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerListing {
    #[serde(flatten)]
    pub descriptor: AnalyzerDescriptor,
    pub enabled: bool,
    /// Missing commands, when availability was checked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
}

fn rule(c: char) -> String {
    c.to_string().repeat(RULE_WIDTH)
}

fn to_jsonl<T: Serialize>(items: impl IntoIterator<Item = T>) -> Result<String> {
    let lines: Vec<String> = items
        .into_iter()
        .map(|item| serde_json::to_string(&item))
        .collect::<std::result::Result<_, _>>()?;
    Ok(lines.join("\n"))
}

/// Render snapshots; a single snapshot renders as an object in JSON mode
pub fn format_snapshots(snapshots: &[Snapshot], format: OutputFormat, verbose: bool) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(match snapshots {
            [single] => serde_json::to_string_pretty(single)?,
            many => serde_json::to_string_pretty(many)?,
        }),
        OutputFormat::Jsonl => to_jsonl(snapshots),
        OutputFormat::Text => Ok(snapshots
            .iter()
            .map(|s| format_snapshot_text(s, verbose))
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

fn format_snapshot_text(snapshot: &Snapshot, verbose: bool) -> String {
    let mut lines = vec![
        rule('='),
        format!("{} {}", "File:".bold(), snapshot.filepath.bright_white().bold()),
        format!("Type: {}", snapshot.file_type),
        format!("Size: {} bytes", snapshot.file_size),
        format!("Modified: {}", snapshot.file_mtime.to_rfc3339()),
        format!("Analyzed: {}", snapshot.timestamp.to_rfc3339()),
    ];
    if let Some(name) = &snapshot.name {
        lines.push(format!("Stored as: {}", name.cyan()));
    }
    lines.push(String::new());

    for (name, outcome) in &snapshot.results {
        lines.push(format!("[{}]", name.bright_cyan()));
        if outcome.success {
            lines.extend(format_analyzer_data(name, &outcome.data, verbose));
            if outcome.truncated {
                lines.push(format!("  {}", "(output truncated)".yellow()));
            }
        } else if outcome.is_skipped() {
            lines.push(format!("  {} {}", "SKIPPED:".yellow(), error_text(outcome)));
        } else {
            lines.push(format!("  {} {}", "ERROR:".bright_red().bold(), error_text(outcome)));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

fn error_text(outcome: &AnalysisOutcome) -> &str {
    outcome.error.as_deref().unwrap_or("unknown error")
}

fn items<'a>(data: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    data.get(key).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn field<'a>(item: &'a Value, key: &str) -> &'a str {
    item.get(key).and_then(Value::as_str).unwrap_or("?")
}

fn push_limited(lines: &mut Vec<String>, values: &[Value], limit: usize, render: impl Fn(&Value) -> String) {
    for value in values.iter().take(limit) {
        lines.push(format!("    {}", render(value)));
    }
    if values.len() > limit {
        lines.push(format!("    ... and {} more", values.len() - limit));
    }
}

fn format_analyzer_data(name: &str, data: &Map<String, Value>, verbose: bool) -> Vec<String> {
    let mut lines = Vec::new();
    match name {
        "what" => {
            let strings = items(data, "strings");
            lines.push(format!("  Identification strings: {}", strings.len()));
            push_limited(&mut lines, strings, usize::MAX, |s| match s {
                Value::String(text) => text.clone(),
                other => field(other, "text").to_string(),
            });
        }
        "dump-h" => {
            let sections = items(data, "sections");
            lines.push(format!("  Sections: {}", sections.len()));
            push_limited(&mut lines, sections, usize::MAX, |s| {
                format!("{}: size={}", field(s, "name"), field(s, "size"))
            });
        }
        "dump-T" => {
            if data.get("has_loader_section") == Some(&Value::Bool(false)) {
                lines.push("  No loader section".to_string());
                return lines;
            }
            let imports = items(data, "imports");
            let exports = items(data, "exports");
            lines.push(format!("  Imports: {}", imports.len()));
            lines.push(format!("  Exports: {}", exports.len()));
            if verbose {
                if !imports.is_empty() {
                    lines.push("  Import symbols:".to_string());
                    push_limited(&mut lines, imports, LIST_LIMIT, |s| field(s, "name").to_string());
                }
                if !exports.is_empty() {
                    lines.push("  Export symbols:".to_string());
                    push_limited(&mut lines, exports, LIST_LIMIT, |s| {
                        format!("{}  {}", field(s, "value"), field(s, "name"))
                    });
                }
            }
        }
        "dump-t" => {
            lines.push(format!("  Symbols: {}", data.get("count").unwrap_or(&Value::Null)));
            if data.get("spilled") == Some(&Value::Bool(true)) {
                lines.push("  (symbol list spilled; statistics and sample only)".to_string());
            }
            if data.get("capped") == Some(&Value::Bool(true)) {
                lines.push(format!("  {}", "(record cap reached)".yellow()));
            }
            if verbose {
                lines.push("  Sample:".to_string());
                push_limited(&mut lines, items(data, "sample"), LIST_LIMIT, |s| {
                    format!("{}  {}", field(s, "sclass"), field(s, "name"))
                });
            }
        }
        "ar-t" => {
            if data.get("is_archive") == Some(&Value::Bool(false)) {
                lines.push("  Not an archive".to_string());
                return lines;
            }
            let members = items(data, "members");
            lines.push(format!("  Members: {}", members.len()));
            let limit = if verbose { usize::MAX } else { LIST_LIMIT };
            push_limited(&mut lines, members, limit, |m| match m {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        _ => {
            for (key, value) in data {
                match value {
                    Value::Array(list) => lines.push(format!("  {}: {} items", key, list.len())),
                    Value::Object(map) => lines.push(format!("  {}: {} fields", key, map.len())),
                    Value::String(s) => lines.push(format!("  {}: {}", key, s)),
                    other => lines.push(format!("  {}: {}", key, other)),
                }
            }
        }
    }
    lines
}

/// Render a comparison; `summary_only` drops per-analyzer details
pub fn format_comparison(
    comparison: &SnapshotComparison,
    format: OutputFormat,
    summary_only: bool,
) -> Result<String> {
    let value = || -> Result<Value> {
        if summary_only {
            Ok(json!({
                "filepath1": comparison.filepath1,
                "filepath2": comparison.filepath2,
                "has_differences": comparison.has_differences,
                "summary": comparison.summary,
            }))
        } else {
            Ok(serde_json::to_value(comparison)?)
        }
    };
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&value()?)?),
        OutputFormat::Jsonl => Ok(serde_json::to_string(&value()?)?),
        OutputFormat::Text => Ok(format_comparison_text(comparison, summary_only)),
    }
}

fn format_comparison_text(comparison: &SnapshotComparison, summary_only: bool) -> String {
    let mut lines = vec![
        rule('='),
        "Comparison Result".bold().to_string(),
        rule('='),
        format!("File 1: {}", comparison.filepath1),
        format!("File 2: {}", comparison.filepath2),
        String::new(),
    ];

    if !comparison.has_differences {
        lines.push(format!("Status: {}", "IDENTICAL".green().bold()));
        return lines.join("\n");
    }
    lines.push(format!("Status: {}", "DIFFERENT".bright_yellow().bold()));
    lines.push(format!("Summary: {}", comparison.summary));
    if summary_only {
        return lines.join("\n");
    }

    lines.push(String::new());
    lines.push("Details:".to_string());
    lines.push("-".repeat(40));

    if !comparison.metadata.is_empty() {
        lines.push("[metadata]".to_string());
        for diff in &comparison.metadata {
            lines.push(format!("  {}: {} -> {}", diff.key, show(&diff.old), show(&diff.new)));
        }
        lines.push(String::new());
    }

    for (name, outcome) in comparison.analyzers.iter().filter(|(_, c)| c.has_differences) {
        lines.push(format!("[{}]", name.bright_cyan()));
        lines.push(format!("  {}", outcome.summary));
        if !outcome.differences.is_empty() {
            for diff in outcome.differences.iter().take(DIFF_LIMIT) {
                lines.push(format!("    {}", format_difference(diff)));
            }
            if outcome.differences.len() > DIFF_LIMIT {
                lines.push(format!("    ... and {} more", outcome.differences.len() - DIFF_LIMIT));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

fn show(value: &Option<Value>) -> String {
    value.as_ref().map_or_else(|| "-".to_string(), show_value)
}

fn show_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_difference(diff: &Difference) -> String {
    match diff.status {
        DiffStatus::Added => format!("{} {}", "+".green(), diff.key),
        DiffStatus::Removed => format!("{} {}", "-".red(), diff.key),
        DiffStatus::Modified => format!(
            "{} {}: {} -> {}",
            "~".yellow(),
            diff.key,
            show(&diff.old),
            show(&diff.new)
        ),
        DiffStatus::Unchanged => format!("  {}", diff.key),
    }
}

/// Render the comparison of two stored snapshot sets
pub fn format_set_comparison(result: &SetComparison, format: OutputFormat) -> Result<String> {
    let changed: Vec<Value> = result
        .changed
        .iter()
        .map(|c| json!({ "filepath": c.filepath1, "summary": c.summary }))
        .collect();
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&json!({
            "snapshot1": result.snapshot1,
            "snapshot2": result.snapshot2,
            "changed": changed,
            "added": result.added,
            "removed": result.removed,
            "unchanged": result.unchanged,
        }))?),
        OutputFormat::Jsonl => {
            let rows = changed
                .into_iter()
                .map(|mut c| {
                    c["status"] = json!("changed");
                    c
                })
                .chain(result.added.iter().map(|f| json!({ "filepath": f, "status": "added" })))
                .chain(result.removed.iter().map(|f| json!({ "filepath": f, "status": "removed" })));
            to_jsonl(rows)
        }
        OutputFormat::Text => {
            let mut lines = vec![
                rule('='),
                format!("Diff: {} vs {}", result.snapshot1.bold(), result.snapshot2.bold()),
                rule('='),
                format!("Changed: {}", result.changed.len()),
                format!("Added: {}", result.added.len()),
                format!("Removed: {}", result.removed.len()),
                format!("Unchanged: {}", result.unchanged),
            ];
            if !result.changed.is_empty() {
                lines.push(String::new());
                lines.push("Changed files:".to_string());
                for comparison in &result.changed {
                    lines.push(format!("  {}", comparison.filepath1));
                    lines.push(format!("    {}", comparison.summary));
                }
            }
            if !result.added.is_empty() {
                lines.push(String::new());
                lines.push("Added files:".to_string());
                lines.extend(result.added.iter().map(|f| format!("  {} {}", "+".green(), f)));
            }
            if !result.removed.is_empty() {
                lines.push(String::new());
                lines.push("Removed files:".to_string());
                lines.extend(result.removed.iter().map(|f| format!("  {} {}", "-".red(), f)));
            }
            Ok(lines.join("\n"))
        }
    }
}

/// Render a header validation report (`info`)
pub fn format_validation(report: &ValidationReport, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Jsonl => Ok(serde_json::to_string(report)?),
        OutputFormat::Text => {
            let mut lines = Vec::new();
            match (&report.file_type, report.valid) {
                (Some(file_type), true) => lines.push(format!("Type: {}", file_type)),
                _ => lines.push(format!(
                    "{} {}",
                    "Invalid:".bright_red().bold(),
                    report.error.as_deref().unwrap_or("unknown error")
                )),
            }
            if !report.details.is_empty() {
                lines.push(String::new());
                lines.push("Details:".to_string());
                for (key, value) in &report.details {
                    lines.push(format!("  {}: {}", key, show_value(value)));
                }
            }
            Ok(lines.join("\n"))
        }
    }
}

/// Render the stored snapshot sets
pub fn format_stored_sets(sets: &[SnapshotSet], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(sets)?),
        OutputFormat::Jsonl => to_jsonl(sets),
        OutputFormat::Text => {
            if sets.is_empty() {
                return Ok("No stored snapshots".to_string());
            }
            let mut lines = vec!["Stored snapshots:".to_string()];
            for set in sets {
                let mut line = format!("  {}: {} files ({})", set.name.bold(), set.file_count, set.created);
                if !set.description.is_empty() {
                    line.push_str(&format!(" - {}", set.description));
                }
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }
    }
}

/// Render the files stored in one set
pub fn format_stored_files(name: &str, files: &[String], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&json!({ "name": name, "files": files }))?),
        OutputFormat::Jsonl => to_jsonl(files),
        OutputFormat::Text => {
            let mut lines = vec![format!("Files in '{}':", name)];
            lines.extend(files.iter().map(|f| format!("  {}", f)));
            Ok(lines.join("\n"))
        }
    }
}

/// Render the registered analyzers
pub fn format_analyzers(analyzers: &[AnalyzerListing], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(analyzers)?),
        OutputFormat::Jsonl => to_jsonl(analyzers),
        OutputFormat::Text => {
            let mut lines = vec!["Available analyzers:".to_string()];
            for listing in analyzers {
                let d = &listing.descriptor;
                let mut line = format!("  {}: {}", d.name.bold(), d.description);
                if !listing.enabled {
                    line.push_str(&format!(" {}", "(disabled)".dimmed()));
                }
                match &listing.missing {
                    Some(missing) if missing.is_empty() => line.push_str(&format!(" [{}]", "OK".green())),
                    Some(missing) => {
                        line.push_str(&format!(" [{} {}]", "MISSING:".red(), missing.join(", ")))
                    }
                    None => {}
                }
                lines.push(line);
            }
            Ok(lines.join("\n"))
        }
    }
}
