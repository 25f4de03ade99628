//! `dump -T` analyzer: loader section imports and exports.

use super::{annotate, collect_tool, exit_failure, tool_args, Analyzer, AnalyzerDescriptor, ToolOutput};
use crate::compare::{diff_keyed, list_field};
use crate::config::AnalyzerOptions;
use crate::snapshot::{AnalysisOutcome, ComparisonOutcome, Difference};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// A row of the loader symbol table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSymbol {
    pub index: u32,
    pub value: String,
    pub section: String,
    pub imex: String,
    pub sclass: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub impid: String,
    pub name: String,
}

impl LoaderSymbol {
    pub fn is_import(&self) -> bool {
        self.imex == "IMP" || self.section == "undef"
    }

    pub fn is_export(&self) -> bool {
        !self.is_import() && self.imex == "EXP"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub name: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub value: String,
    pub section: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// An entry of the import file strings table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFile {
    pub index: u32,
    pub path: String,
    pub base: String,
    pub member: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct LoaderSection {
    pub symbols: Vec<LoaderSymbol>,
    pub import_files: Vec<ImportFile>,
}

impl LoaderSection {
    pub fn imports(&self) -> Vec<Import> {
        self.symbols
            .iter()
            .filter(|s| s.is_import())
            .map(|s| Import {
                name: s.name.clone(),
                source: s.impid.clone(),
                kind: s.kind.clone(),
            })
            .collect()
    }

    pub fn exports(&self) -> Vec<Export> {
        self.symbols
            .iter()
            .filter(|s| s.is_export())
            .map(|s| Export {
                name: s.name.clone(),
                value: s.value.clone(),
                section: s.section.clone(),
                kind: s.kind.clone(),
            })
            .collect()
    }
}

pub struct LoaderAnalyzer {
    descriptor: AnalyzerDescriptor,
}

impl LoaderAnalyzer {
    pub fn new() -> Self {
        // Not concurrent-safe: dump -T spools the loader section through a shared scratch file
        Self {
            descriptor: AnalyzerDescriptor::new("dump-T", "Loader section")
                .description("Display loader section (imports/exports)")
                .requires("dump")
                .priority(30),
        }
    }

    fn run_dump(&self, path: &Path, options: &AnalyzerOptions) -> Result<ToolOutput, AnalysisOutcome> {
        let name = self.descriptor.name.as_str();
        let output = collect_tool(name, "dump", &tool_args(options, &["-Tv"], path), options)?;
        if output.report.success() {
            return Ok(output);
        }
        debug!(analyzer = name, "dump -Tv failed, retrying with -T");
        collect_tool(name, "dump", &tool_args(options, &["-T"], path), options)
    }
}

impl Default for LoaderAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for LoaderAnalyzer {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        let output = match self.run_dump(path, options) {
            Ok(output) => output,
            Err(failed) => return failed,
        };

        let has_loader_section = if output.report.success() {
            true
        } else if reports_no_loader_section(&output) {
            false
        } else {
            return exit_failure(name, &output.report);
        };

        let loader = parse_loader_section(output.lines.iter().map(String::as_str));
        let imports = loader.imports();
        let exports = loader.exports();

        let mut data = Map::new();
        data.insert("has_loader_section".into(), Value::from(has_loader_section));
        data.insert("symbol_count".into(), Value::from(loader.symbols.len()));
        data.insert("import_count".into(), Value::from(imports.len()));
        data.insert("export_count".into(), Value::from(exports.len()));
        data.insert("imports".into(), to_array(&imports));
        data.insert("exports".into(), to_array(&exports));
        data.insert("import_files".into(), to_array(&loader.import_files));

        annotate(AnalysisOutcome::success(name, data), &output.report)
    }

    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        let analyzer = self.descriptor.name.as_str();
        let mut differences: Vec<Difference> = Vec::new();
        let mut unchanged = 0;

        for table in ["imports", "exports"] {
            let part = diff_keyed(
                analyzer,
                list_field(&old.data, table),
                list_field(&new.data, table),
                "name",
            );
            unchanged += part.count("unchanged");
            differences.extend(part.differences.into_iter().map(|mut d| {
                d.key = format!("{}:{}", table, d.key);
                d
            }));
        }

        ComparisonOutcome::from_differences(analyzer, differences, unchanged)
    }
}

fn to_array<T: Serialize>(items: &[T]) -> Value {
    serde_json::to_value(items).unwrap_or(Value::Array(Vec::new()))
}

/// Objects without a loader section (plain `.o` files) make dump exit non-zero
fn reports_no_loader_section(output: &ToolOutput) -> bool {
    let mentions = |text: &str| {
        let text = text.to_ascii_lowercase();
        text.contains("no loader section") || text.contains("loader section header")
    };
    mentions(&output.report.stderr) || output.lines.iter().any(|line| mentions(line))
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn symbol_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*\[\s*(\d+)\]\s+(0x[0-9a-fA-F]+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)",
        )
        .expect("valid regex")
    })
}

pub fn parse_loader_section<'a, I>(lines: I) -> LoaderSection
where
    I: IntoIterator<Item = &'a str>,
{
    enum Table {
        None,
        Symbols,
        ImportFiles,
    }

    let mut section = LoaderSection::default();
    let mut table = Table::None;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.contains("Import File Strings") {
            table = Table::ImportFiles;
            continue;
        }
        if trimmed.contains("Symbol") && trimmed.contains("Table") {
            table = Table::Symbols;
            continue;
        }

        match table {
            Table::None => {}
            Table::Symbols => {
                if let Some(caps) = symbol_row_regex().captures(line) {
                    section.symbols.push(LoaderSymbol {
                        index: caps[1].parse().unwrap_or(0),
                        value: caps[2].to_string(),
                        section: caps[3].to_string(),
                        imex: caps[4].to_string(),
                        sclass: caps[5].to_string(),
                        kind: caps[6].to_string(),
                        impid: caps[7].to_string(),
                        name: caps[8].to_string(),
                    });
                }
            }
            Table::ImportFiles => {
                if let Some(entry) = parse_import_file(trimmed) {
                    section.import_files.push(entry);
                }
            }
        }
    }
    section
}

/// `INDEX [PATH] [BASE MEMBER]`; rows with a single field carry only the path
fn parse_import_file(line: &str) -> Option<ImportFile> {
    let mut parts = line.split_whitespace();
    let index = parts.next()?.parse().ok()?;
    let rest: Vec<&str> = parts.collect();
    let (path, base, member) = match rest.as_slice() {
        [path] => (*path, "", ""),
        [base, member] => ("", *base, *member),
        [path, base, member, ..] => (*path, *base, *member),
        [] => return None,
    };
    Some(ImportFile {
        index,
        path: path.to_string(),
        base: base.to_string(),
        member: member.to_string(),
    })
}
