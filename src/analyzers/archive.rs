//! `ar -t` analyzer: archive member names.

use super::{annotate, collect_tool, exit_failure, tool_args, Analyzer, AnalyzerDescriptor, Capability};
use crate::compare::{diff_sets, list_field};
use crate::config::AnalyzerOptions;
use crate::process::ProcessReport;
use crate::snapshot::{AnalysisOutcome, ComparisonOutcome};
use serde_json::{Map, Value};
use std::path::Path;

pub struct ArchiveMemberAnalyzer {
    descriptor: AnalyzerDescriptor,
}

impl ArchiveMemberAnalyzer {
    pub fn new() -> Self {
        Self {
            descriptor: AnalyzerDescriptor::new("ar-t", "Archive members")
                .description("List members of an archive")
                .requires("ar")
                .capability(Capability::ConcurrentSafe)
                .priority(50),
        }
    }
}

impl Default for ArchiveMemberAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for ArchiveMemberAnalyzer {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        let output = match collect_tool(name, "ar", &tool_args(options, &["-t"], path), options) {
            Ok(output) => output,
            Err(failed) => return failed,
        };

        let mut data = Map::new();
        if !output.report.success() {
            if !is_not_an_archive(&output.report) {
                return exit_failure(name, &output.report);
            }
            data.insert("is_archive".into(), Value::Bool(false));
            data.insert("count".into(), Value::from(0));
            data.insert("members".into(), Value::Array(Vec::new()));
            return annotate(AnalysisOutcome::success(name, data), &output.report);
        }

        let members: Vec<Value> = output
            .lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .map(Value::from)
            .collect();
        data.insert("is_archive".into(), Value::Bool(true));
        data.insert("count".into(), Value::from(members.len()));
        data.insert("members".into(), Value::Array(members));

        annotate(AnalysisOutcome::success(name, data), &output.report)
    }

    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        diff_sets(&self.descriptor.name, member_names(&old.data), member_names(&new.data))
    }
}

fn member_names(data: &Map<String, Value>) -> impl Iterator<Item = &str> {
    list_field(data, "members").iter().filter_map(Value::as_str)
}

/// Plain object files are an expected input; `ar` rejects them with one of these
fn is_not_an_archive(report: &ProcessReport) -> bool {
    let stderr = report.stderr.to_ascii_lowercase();
    stderr.contains("not an archive") || stderr.contains("file format not recognized")
}
