pub mod archive;
pub mod command;
pub mod loader;
pub mod sections;
pub mod symbols;
pub mod what;

use crate::compare::diff_data;
use crate::config::AnalyzerOptions;
use crate::process::{self, OutputLimits, ProcessOutcome, ProcessReport};
use crate::snapshot::{meta, AnalysisOutcome, ComparisonOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// What an analyzer is able to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CanSnapshot,
    CanCompare,
    SupportsStreaming,
    /// May run in parallel with other analyzers on the same file
    ConcurrentSafe,
}

/// Static description of an analyzer; immutable once registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerDescriptor {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub version: String,
    pub required_commands: Vec<String>,
    pub capabilities: BTreeSet<Capability>,
    pub default_enabled: bool,
    /// Lower runs first
    pub priority: i32,
}

impl AnalyzerDescriptor {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: String::new(),
            version: "1.0".to_string(),
            required_commands: Vec::new(),
            capabilities: BTreeSet::from([Capability::CanSnapshot, Capability::CanCompare]),
            default_enabled: true,
            priority: 100,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn requires(mut self, command: impl Into<String>) -> Self {
        self.required_commands.push(command.into());
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn default_enabled(mut self, enabled: bool) -> Self {
        self.default_enabled = enabled;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn concurrent_safe(&self) -> bool {
        self.has(Capability::ConcurrentSafe)
    }
}

/// A unit of analysis against one file.
///
/// `analyze` encodes every expected failure (missing output, timeouts,
/// non-zero exits) in the returned outcome instead of panicking.
pub trait Analyzer: Send + Sync {
    fn descriptor(&self) -> &AnalyzerDescriptor;

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome;

    /// Compare two successful outcomes of this analyzer
    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        diff_data(&self.descriptor().name, &old.data, &new.data)
    }

    /// Required commands that are not on PATH
    fn check_requirements(&self) -> Vec<String> {
        self.descriptor()
            .required_commands
            .iter()
            .filter(|cmd| !process::command_exists(cmd))
            .cloned()
            .collect()
    }
}

/// The analyzers shipped with the crate, in priority order
pub fn builtin_analyzers() -> Vec<Arc<dyn Analyzer>> {
    vec![
        Arc::new(what::WhatAnalyzer::new()),
        Arc::new(sections::SectionHeaderAnalyzer::new()),
        Arc::new(loader::LoaderAnalyzer::new()),
        Arc::new(symbols::SymbolTableAnalyzer::new()),
        Arc::new(archive::ArchiveMemberAnalyzer::new()),
    ]
}

/// Stdout of a tool that ran to completion
pub(crate) struct ToolOutput {
    pub lines: Vec<String>,
    pub report: ProcessReport,
}

impl ToolOutput {
    pub fn raw(&self) -> String {
        self.lines.join("\n")
    }
}

/// Run a tool, streaming each stdout line to `on_line`.
///
/// Timeouts, launch failures and runner faults come back as a failed outcome
/// for `analyzer`; a completed run (whatever its exit code) returns the report.
pub(crate) fn stream_tool<F>(
    analyzer: &str,
    program: &str,
    args: &[OsString],
    options: &AnalyzerOptions,
    on_line: F,
) -> Result<ProcessReport, AnalysisOutcome>
where
    F: FnMut(&str),
{
    let limits = OutputLimits::from_options(options);
    debug!(analyzer, program, ?args, "Running tool");

    match process::run_bounded(program, args, &limits, on_line) {
        Ok(ProcessOutcome::Completed(report)) => Ok(report),
        Ok(ProcessOutcome::TimedOut(report)) => Err(annotate(
            AnalysisOutcome::failure(
                analyzer,
                format!("Timeout after {}s", options.timeout.as_secs()),
            )
            .with_metadata(meta::TIMED_OUT, true),
            &report,
        )),
        Ok(ProcessOutcome::LaunchFailed { program, message, .. }) => Err(AnalysisOutcome::failure(
            analyzer,
            format!("cannot run {}: {}", program, message),
        )),
        Err(e) => Err(AnalysisOutcome::failure(analyzer, e.to_string())),
    }
}

/// Run a tool and keep its stdout lines
pub(crate) fn collect_tool(
    analyzer: &str,
    program: &str,
    args: &[OsString],
    options: &AnalyzerOptions,
) -> Result<ToolOutput, AnalysisOutcome> {
    let mut lines = Vec::new();
    let report = stream_tool(analyzer, program, args, options, |line| {
        lines.push(line.to_string())
    })?;
    Ok(ToolOutput { lines, report })
}

/// Record byte/line counters and the truncation flag of a run on an outcome
pub(crate) fn annotate(outcome: AnalysisOutcome, report: &ProcessReport) -> AnalysisOutcome {
    let mut outcome = outcome
        .with_metadata(meta::BYTES_READ, report.bytes_read)
        .with_metadata(meta::LINES, report.lines);
    if let Some(code) = report.exit_code {
        outcome = outcome.with_metadata(meta::EXIT_CODE, code);
    }
    let truncated = outcome.truncated || report.truncated;
    outcome.with_truncated(truncated)
}

/// Failed outcome for a tool that exited unsuccessfully
pub(crate) fn exit_failure(analyzer: &str, report: &ProcessReport) -> AnalysisOutcome {
    annotate(AnalysisOutcome::failure(analyzer, report.failure_message()), report)
}

/// `[-X<mode>, flags..., path]`
pub(crate) fn tool_args(options: &AnalyzerOptions, flags: &[&str], path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(flags.len() + 2);
    args.push(options.object_mode.flag().into());
    args.extend(flags.iter().map(OsString::from));
    args.push(path.as_os_str().to_os_string());
    args
}
