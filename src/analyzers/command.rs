//! Analyzers described by a YAML manifest instead of code.
//!
//! ```yaml
//! name: strings
//! display_name: Printable strings
//! program: strings
//! args: ["-a", "{file}"]
//! priority: 60
//! concurrent_safe: true
//! ```
//!
//! The analyzer runs the program with `{file}` replaced by the target path and
//! records the non-empty output lines.

use super::{annotate, collect_tool, exit_failure, Analyzer, AnalyzerDescriptor, Capability};
use crate::compare::{diff_sets, list_field};
use crate::config::AnalyzerOptions;
use crate::error::{Error, Result};
use crate::snapshot::{AnalysisOutcome, ComparisonOutcome};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::Path;

/// Placeholder replaced by the target path in manifest arguments
pub const FILE_PLACEHOLDER: &str = "{file}";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandManifest {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Commands that must be on PATH; defaults to `program`
    #[serde(default)]
    pub requires: Option<Vec<String>>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub default_enabled: bool,
    #[serde(default)]
    pub concurrent_safe: bool,
    /// Exit codes treated as success
    #[serde(default = "default_exit_codes")]
    pub success_exit_codes: Vec<i32>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_args() -> Vec<String> {
    vec![FILE_PLACEHOLDER.to_string()]
}

fn default_priority() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_exit_codes() -> Vec<i32> {
    vec![0]
}

impl CommandManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::configuration(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_name {
            return Err(Error::configuration(format!(
                "invalid analyzer name '{}' (use letters, digits, '-', '_', '.')",
                self.name
            )));
        }
        if self.program.trim().is_empty() {
            return Err(Error::configuration(format!("analyzer '{}' has no program", self.name)));
        }
        if self.success_exit_codes.is_empty() {
            return Err(Error::configuration(format!(
                "analyzer '{}' accepts no exit code as success",
                self.name
            )));
        }
        Ok(())
    }
}

pub struct ExternalCommandAnalyzer {
    descriptor: AnalyzerDescriptor,
    program: String,
    args: Vec<String>,
    success_exit_codes: Vec<i32>,
}

impl ExternalCommandAnalyzer {
    pub fn from_manifest(manifest: CommandManifest) -> Result<Self> {
        manifest.validate()?;

        let display_name = manifest.display_name.unwrap_or_else(|| manifest.name.clone());
        let mut descriptor = AnalyzerDescriptor::new(manifest.name, display_name)
            .description(manifest.description)
            .version(manifest.version)
            .priority(manifest.priority)
            .default_enabled(manifest.default_enabled);
        for command in manifest.requires.unwrap_or_else(|| vec![manifest.program.clone()]) {
            descriptor = descriptor.requires(command);
        }
        if manifest.concurrent_safe {
            descriptor = descriptor.capability(Capability::ConcurrentSafe);
        }

        Ok(Self {
            descriptor,
            program: manifest.program,
            args: manifest.args,
            success_exit_codes: manifest.success_exit_codes,
        })
    }

    fn expand_args(&self, path: &Path) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| {
                if arg == FILE_PLACEHOLDER {
                    path.as_os_str().to_os_string()
                } else if arg.contains(FILE_PLACEHOLDER) {
                    OsString::from(arg.replace(FILE_PLACEHOLDER, &path.to_string_lossy()))
                } else {
                    OsString::from(arg)
                }
            })
            .collect()
    }
}

impl Analyzer for ExternalCommandAnalyzer {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        let output = match collect_tool(name, &self.program, &self.expand_args(path), options) {
            Ok(output) => output,
            Err(failed) => return failed,
        };
        let accepted = output
            .report
            .exit_code
            .is_some_and(|code| self.success_exit_codes.contains(&code));
        if !accepted {
            return exit_failure(name, &output.report);
        }

        let lines: Vec<Value> = output
            .lines
            .iter()
            .map(|line| line.trim_end())
            .filter(|line| !line.is_empty())
            .map(Value::from)
            .collect();
        let mut data = Map::new();
        data.insert("count".into(), Value::from(lines.len()));
        data.insert("lines".into(), Value::Array(lines));

        annotate(
            AnalysisOutcome::success(name, data).with_raw_output(output.raw(), options.raw_output_limit),
            &output.report,
        )
    }

    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        diff_sets(&self.descriptor.name, output_lines(&old.data), output_lines(&new.data))
    }
}

fn output_lines(data: &Map<String, Value>) -> impl Iterator<Item = &str> {
    list_field(data, "lines").iter().filter_map(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_defaults() {
        let manifest = CommandManifest::from_yaml("name: strings\nprogram: strings\n").unwrap();
        assert_eq!(manifest.args, vec!["{file}"]);
        assert_eq!(manifest.priority, 100);
        assert!(manifest.default_enabled);
        assert!(!manifest.concurrent_safe);

        let analyzer = ExternalCommandAnalyzer::from_manifest(manifest).unwrap();
        let d = analyzer.descriptor();
        assert_eq!(d.display_name, "strings");
        assert_eq!(d.required_commands, vec!["strings"]);
        assert!(!d.concurrent_safe());
    }

    #[test]
    fn test_manifest_rejects_bad_input() {
        assert!(CommandManifest::from_yaml("name: 'bad name'\nprogram: x\n").is_err());
        assert!(CommandManifest::from_yaml("name: ok\nprogram: ''\n").is_err());
        assert!(CommandManifest::from_yaml("name: ok\nprogram: x\ncolour: red\n").is_err());
        assert!(CommandManifest::from_yaml("name: ok\n").is_err());
    }

    #[test]
    fn test_expand_args() {
        let manifest = CommandManifest::from_yaml(
            "name: od\nprogram: od\nargs: ['-c', '{file}', '--label={file}']\n",
        )
        .unwrap();
        let analyzer = ExternalCommandAnalyzer::from_manifest(manifest).unwrap();
        let args = analyzer.expand_args(Path::new("/tmp/a.o"));
        assert_eq!(
            args,
            vec![OsString::from("-c"), "/tmp/a.o".into(), "--label=/tmp/a.o".into()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_analyze_collects_lines() {
        let manifest = CommandManifest::from_yaml(
            "name: echo-lines\nprogram: /bin/sh\nrequires: []\nargs: ['-c', 'printf \"one\\n\\ntwo\\n\"; true', '{file}']\n",
        )
        .unwrap();
        let analyzer = ExternalCommandAnalyzer::from_manifest(manifest).unwrap();
        let outcome = analyzer.analyze(Path::new("/dev/null"), &AnalyzerOptions::default());
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.data["count"], 2);
        assert_eq!(outcome.data["lines"][1], "two");
        assert!(outcome.raw_output.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_analyze_unaccepted_exit_code_fails() {
        let manifest = CommandManifest::from_yaml(
            "name: fails\nprogram: /bin/sh\nargs: ['-c', 'echo broken >&2; exit 3']\n",
        )
        .unwrap();
        let analyzer = ExternalCommandAnalyzer::from_manifest(manifest).unwrap();
        let outcome = analyzer.analyze(Path::new("/dev/null"), &AnalyzerOptions::default());
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("broken"));
        assert_eq!(outcome.metadata["exit_code"], 3);
    }
}
