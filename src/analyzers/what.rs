//! `what` analyzer: SCCS `@(#)` identification strings.

use super::{annotate, collect_tool, exit_failure, Analyzer, AnalyzerDescriptor, Capability};
use crate::compare::{diff_sets, list_field};
use crate::config::AnalyzerOptions;
use crate::snapshot::{AnalysisOutcome, ComparisonOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::Path;
use std::sync::OnceLock;

/// One identification string with whatever fields could be recognized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatString {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

pub struct WhatAnalyzer {
    descriptor: AnalyzerDescriptor,
}

impl WhatAnalyzer {
    pub fn new() -> Self {
        Self {
            descriptor: AnalyzerDescriptor::new("what", "Identification strings")
                .description("Extract @(#) identification strings")
                .requires("what")
                .capability(Capability::ConcurrentSafe)
                .priority(10),
        }
    }
}

impl Default for WhatAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for WhatAnalyzer {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        // `what` has no object mode flag
        let args = [OsString::from(path.as_os_str())];
        let output = match collect_tool(name, "what", &args, options) {
            Ok(output) => output,
            Err(failed) => return failed,
        };

        // `what` exits non-zero when nothing matched; only fail when there is nothing to show
        if !output.report.success() && output.lines.iter().all(|l| l.trim().is_empty()) {
            return exit_failure(name, &output.report);
        }

        let strings = parse_what_output(output.lines.iter().map(String::as_str));
        let mut data = Map::new();
        data.insert("count".into(), Value::from(strings.len()));
        data.insert(
            "strings".into(),
            serde_json::to_value(&strings).unwrap_or(Value::Array(Vec::new())),
        );

        annotate(AnalysisOutcome::success(name, data), &output.report)
    }

    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        diff_sets(
            &self.descriptor.name,
            texts(list_field(&old.data, "strings")),
            texts(list_field(&new.data, "strings")),
        )
    }
}

/// Literal text of each string; older snapshots stored plain strings
fn texts(items: &[Value]) -> impl Iterator<Item = &str> {
    items.iter().filter_map(|item| match item {
        Value::String(s) => Some(s.as_str()),
        other => other.get("text").and_then(Value::as_str),
    })
}

/// Every non-empty line that is not a `path:` header is an identification string
pub fn parse_what_output<'a, I>(lines: I) -> Vec<WhatString>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with(':'))
        .map(parse_what_string)
        .collect()
}

pub fn parse_what_string(line: &str) -> WhatString {
    let capture = |re: &Regex| re.captures(line).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());
    WhatString {
        text: line.to_string(),
        source: capture(source_regex()),
        version: capture(version_regex()),
        date: capture(date_regex()),
        time: capture(time_regex()),
    }
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn source_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[\s(])([\w./-]+\.(?:c|h|cc|cpp|cxx|C|s|S|f|y|l|sh|mod|cbl|rpgle|clle|cmd))\b")
            .expect("valid regex")
    })
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)v?(\d+(?:\.\d+)+)(?:\s|$)").expect("valid regex"))
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{2,4}[/-]\d{1,2}[/-]\d{1,4})\b").expect("valid regex"))
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2}:\d{2}(?::\d{2})?)\b").expect("valid regex"))
}
