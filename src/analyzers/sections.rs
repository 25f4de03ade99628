//! `dump -h` analyzer: section headers.
//!
//! Two layouts are understood. AIX prints each section over two lines:
//!
//! ```text
//! [  0]	.text	0x0000000000000000  0x0000000010000128  0x00000368
//! 	0x00000128	   2**2     0x00000000     0x00000000  0x0020
//! ```
//!
//! Other `dump` builds print a single `Idx Name Size VMA LMA File-off` row.

use super::{annotate, collect_tool, exit_failure, tool_args, Analyzer, AnalyzerDescriptor, Capability};
use crate::compare::{diff_keyed, list_field};
use crate::config::AnalyzerOptions;
use crate::snapshot::{AnalysisOutcome, ComparisonOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHeader {
    pub index: u32,
    pub name: String,
    pub size: String,
    pub size_decimal: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_numbers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
}

pub struct SectionHeaderAnalyzer {
    descriptor: AnalyzerDescriptor,
}

impl SectionHeaderAnalyzer {
    pub fn new() -> Self {
        Self {
            descriptor: AnalyzerDescriptor::new("dump-h", "Section headers")
                .description("Display section headers")
                .requires("dump")
                .capability(Capability::ConcurrentSafe)
                .priority(20),
        }
    }
}

impl Default for SectionHeaderAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for SectionHeaderAnalyzer {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        let args = tool_args(options, &["-h"], path);
        let output = match collect_tool(name, "dump", &args, options) {
            Ok(output) => output,
            Err(failed) => return failed,
        };
        if !output.report.success() {
            return exit_failure(name, &output.report);
        }

        let sections = parse_section_headers(output.lines.iter().map(String::as_str));
        let total_size: u64 = sections.iter().map(|s| s.size_decimal).sum();

        let mut data = Map::new();
        data.insert("count".into(), Value::from(sections.len()));
        data.insert("total_size".into(), Value::from(total_size));
        data.insert(
            "sections".into(),
            serde_json::to_value(&sections).unwrap_or(Value::Array(Vec::new())),
        );

        let mut outcome = AnalysisOutcome::success(name, data);
        if sections.is_empty() {
            // Unrecognized layout; keep the text so the snapshot is still useful
            outcome = outcome.with_raw_output(output.raw(), options.raw_output_limit);
        }
        annotate(outcome, &output.report)
    }

    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        diff_keyed(
            &self.descriptor.name,
            list_field(&old.data, "sections"),
            list_field(&new.data, "sections"),
            "name",
        )
    }
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn aix_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\[\s*(\d+)\]\s+(\S+)\s+(0x[0-9a-fA-F]+)\s+(0x[0-9a-fA-F]+)\s+(0x[0-9a-fA-F]+)")
            .expect("valid regex")
    })
}

fn parse_hex(s: &str) -> u64 {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).unwrap_or(0)
}

pub fn parse_section_headers<'a, I>(lines: I) -> Vec<SectionHeader>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sections = Vec::new();
    let mut in_headers = false;
    let mut current: Option<SectionHeader> = None;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.contains("Section Header") || trimmed.starts_with("Idx") {
            in_headers = true;
            continue;
        }
        if !in_headers {
            continue;
        }

        if let Some(caps) = aix_row_regex().captures(line) {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            let size = caps[5].to_string();
            current = Some(SectionHeader {
                index: caps[1].parse().unwrap_or(0),
                name: caps[2].to_string(),
                size_decimal: parse_hex(&size),
                size,
                physical_addr: Some(caps[3].to_string()),
                virtual_addr: Some(caps[4].to_string()),
                ..Default::default()
            });
            continue;
        }

        if trimmed.starts_with("0x") {
            if let Some(section) = current.as_mut() {
                let parts: Vec<&str> = trimmed.split_whitespace().collect();
                if parts.len() >= 5 {
                    section.offset = Some(parts[0].to_string());
                    section.alignment = Some(parts[1].to_string());
                    section.relocation = Some(parts[2].to_string());
                    section.line_numbers = Some(parts[3].to_string());
                    section.flags = Some(parts[4].to_string());
                }
                continue;
            }
        }

        // Tabular layout: index name size [vma [lma [offset]]]
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() >= 3 && parts[0].chars().all(|c| c.is_ascii_digit()) {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            let size = parts[2].to_string();
            sections.push(SectionHeader {
                index: parts[0].parse().unwrap_or(0),
                name: parts[1].to_string(),
                size_decimal: parse_hex(&size),
                size,
                virtual_addr: parts.get(3).map(|s| s.to_string()),
                physical_addr: parts.get(4).map(|s| s.to_string()),
                offset: parts.get(5).map(|s| s.to_string()),
                ..Default::default()
            });
        }
    }

    if let Some(done) = current {
        sections.push(done);
    }
    sections
}
