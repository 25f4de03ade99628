//! `dump -t` analyzer: the full symbol table.
//!
//! Symbol tables of large archives run to millions of rows, so rows are fed
//! straight from the process runner into a `ResultAccumulator`. The snapshot
//! keeps the full sorted list only when it fit under the memory ceiling;
//! otherwise it records the count, per-field statistics and a uniform sample.

use super::{annotate, exit_failure, stream_tool, tool_args, Analyzer, AnalyzerDescriptor, Capability};
use crate::accumulator::{Record, ResultAccumulator};
use crate::compare::{diff_data, diff_keyed, list_field};
use crate::config::AnalyzerOptions;
use crate::error::Result;
use crate::process::ProcessReport;
use crate::snapshot::{meta, AnalysisOutcome, ComparisonOutcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// A main (`m`) entry of the symbol table; auxiliary rows are skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSymbol {
    pub index: u64,
    pub value: String,
    pub section: String,
    pub aux: u32,
    pub sclass: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
}

impl Record for TableSymbol {
    fn estimated_size(&self) -> usize {
        self.value.len()
            + self.section.len()
            + self.sclass.len()
            + self.kind.as_ref().map_or(0, String::len)
            + self.name.len()
            + 16
    }

    fn visit_numeric(&self, visit: &mut dyn FnMut(&str, f64)) {
        let digits = self.value.trim_start_matches("0x");
        if let Ok(value) = u64::from_str_radix(digits, 16) {
            visit("value", value as f64);
        }
        visit("aux", f64::from(self.aux));
    }
}

pub struct SymbolTableAnalyzer {
    descriptor: AnalyzerDescriptor,
}

impl SymbolTableAnalyzer {
    pub fn new() -> Self {
        Self {
            descriptor: AnalyzerDescriptor::new("dump-t", "Symbol table")
                .description("Summarize the full symbol table")
                .requires("dump")
                .capability(Capability::SupportsStreaming)
                .default_enabled(false)
                .priority(40),
        }
    }

    fn summarize(
        &self,
        accumulator: ResultAccumulator<TableSymbol>,
        options: &AnalyzerOptions,
    ) -> Result<Map<String, Value>> {
        let result = accumulator.finish()?;
        let mut data = Map::new();
        data.insert("count".into(), Value::from(result.total_count));
        data.insert("spilled".into(), Value::from(result.is_spilled()));
        data.insert("capped".into(), Value::from(result.capped));
        data.insert("statistics".into(), serde_json::to_value(&result.stats)?);

        let mut sample = result.sample.clone();
        sample.sort_by(|a, b| a.index.cmp(&b.index));
        data.insert("sample".into(), serde_json::to_value(&sample)?);

        if let Some(mut symbols) = result.records.clone() {
            symbols.sort_by(|a, b| a.name.cmp(&b.name).then(a.index.cmp(&b.index)));
            data.insert("symbols".into(), serde_json::to_value(&symbols)?);
        } else if let Some(spill) = &result.spill {
            // Per-class counts survive even when the rows themselves do not
            let mut by_class: Map<String, Value> = Map::new();
            for symbol in spill.records()? {
                let symbol = symbol?;
                let count = by_class.get(&symbol.sclass).and_then(Value::as_u64).unwrap_or(0);
                by_class.insert(symbol.sclass, Value::from(count + 1));
            }
            data.insert("storage_classes".into(), Value::Object(by_class));
            debug!(
                analyzer = %self.descriptor.name,
                spilled = spill.record_count(),
                ceiling = options.memory_ceiling,
                "Symbol table exceeded memory ceiling"
            );
        }

        result.release()?;
        Ok(data)
    }

    /// Outcome of a completed run; rows dropped by the record cap mark it truncated
    fn outcome(
        &self,
        accumulator: ResultAccumulator<TableSymbol>,
        report: &ProcessReport,
        options: &AnalyzerOptions,
    ) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        if !report.success() && accumulator.total() == 0 {
            return exit_failure(name, report);
        }

        let spilled = accumulator.is_spilled();
        let capped = accumulator.is_capped();
        match self.summarize(accumulator, options) {
            Ok(data) => annotate(
                AnalysisOutcome::success(name, data)
                    .with_metadata(meta::SPILLED, spilled)
                    .with_truncated(capped),
                report,
            ),
            Err(e) => annotate(AnalysisOutcome::failure(name, e.to_string()), report),
        }
    }
}

impl Default for SymbolTableAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for SymbolTableAnalyzer {
    fn descriptor(&self) -> &AnalyzerDescriptor {
        &self.descriptor
    }

    fn analyze(&self, path: &Path, options: &AnalyzerOptions) -> AnalysisOutcome {
        let name = self.descriptor.name.as_str();
        let mut accumulator = ResultAccumulator::new(
            options.memory_ceiling,
            options.sample_size,
            options.spill_dir(),
        )
        .with_record_cap(options.max_records);
        let mut spill_error = None;

        let args = tool_args(options, &["-tv"], path);
        let report = match stream_tool(name, "dump", &args, options, |line| {
            if spill_error.is_some() {
                return;
            }
            if let Some(symbol) = parse_symbol_row(line) {
                if let Err(e) = accumulator.add(symbol) {
                    spill_error = Some(e);
                }
            }
        }) {
            Ok(report) => report,
            Err(failed) => return failed,
        };

        if let Some(e) = spill_error {
            warn!(analyzer = name, error = %e, "Symbol accumulation failed");
            return annotate(AnalysisOutcome::failure(name, e.to_string()), &report);
        }
        self.outcome(accumulator, &report, options)
    }

    fn compare(
        &self,
        old: &AnalysisOutcome,
        new: &AnalysisOutcome,
        _options: &AnalyzerOptions,
    ) -> ComparisonOutcome {
        let name = self.descriptor.name.as_str();
        match (old.data.get("symbols"), new.data.get("symbols")) {
            (Some(_), Some(_)) => diff_keyed(
                name,
                list_field(&old.data, "symbols"),
                list_field(&new.data, "symbols"),
                "name",
            ),
            // At least one side only has a summary
            _ => {
                let summary = |data: &Map<String, Value>| {
                    let mut summary = data.clone();
                    summary.remove("symbols");
                    summary.remove("sample");
                    summary
                };
                diff_data(name, &summary(&old.data), &summary(&new.data))
            }
        }
    }
}

#[allow(clippy::expect_used)] // Static regex pattern is hardcoded and valid
fn symbol_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\[\s*(\d+)\]\s+m\s+(0x[0-9a-fA-F]+)\s+(\S+)\s+(\d+)\s+(\S+)\s+(.+?)\s*$")
            .expect("valid regex")
    })
}

/// `[Index] m Value Scn Aux Sclass [Type] Name`
pub fn parse_symbol_row(line: &str) -> Option<TableSymbol> {
    let caps = symbol_row_regex().captures(line)?;
    let rest: Vec<&str> = caps[6].split_whitespace().collect();
    let (kind, name) = match rest.as_slice() {
        [name] => (None, *name),
        [kind, .., name] => (Some(kind.to_string()), *name),
        [] => return None,
    };
    Some(TableSymbol {
        index: caps[1].parse().ok()?,
        value: caps[2].to_string(),
        section: caps[3].to_string(),
        aux: caps[4].parse().unwrap_or(0),
        sclass: caps[5].to_string(),
        kind,
        name: name.to_string(),
    })
}
