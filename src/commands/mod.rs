//! Subcommand implementations for the xcoffscan CLI.
//!
//! Each command renders its result into a [`CommandOutput`]; `main` decides
//! where the text goes (stdout or `--output`) and exits with its code.
//!
//! - `snapshot`: run the engine over files, optionally storing the snapshots
//! - `compare`: compare two files or snapshot documents, or a file against a stored set
//! - `diff`: compare two stored sets
//! - `info` / `validate`: header validation
//! - `list`: stored sets and their files
//! - `analyzers`: registered analyzers and their tool availability

pub(crate) mod analyzers;
pub(crate) mod compare;
pub(crate) mod diff;
pub(crate) mod info;
pub(crate) mod list;
pub(crate) mod snapshot;

use crate::cli::Args;
use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use xcoffscan::config::{self, AnalyzerOptions, EngineConfig, FileConfig};
use xcoffscan::engine::{AnalysisEngine, Selection};
use xcoffscan::output::OutputFormat;
use xcoffscan::registry::{self, EnablePolicy};
use xcoffscan::store::SnapshotStore;

/// Rendered result of a command
pub(crate) struct CommandOutput {
    pub text: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(text: String, exit_code: i32) -> Self {
        Self { text, exit_code }
    }

    pub fn ok(text: String) -> Self {
        Self::new(text, 0)
    }
}

/// Everything a command needs, resolved from flags and the config file
pub(crate) struct Session {
    pub engine: AnalysisEngine,
    pub selection: Selection,
    pub format: OutputFormat,
    pub verbose: bool,
    db_path: Option<PathBuf>,
}

impl Session {
    /// Resolve configuration (defaults, then config file, then flags) and
    /// prepare the process-wide analyzer registry.
    pub fn from_args(args: &Args) -> Result<Self> {
        let file_config = match &args.config {
            Some(path) => FileConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => FileConfig::load_default(),
        };

        let mut config = EngineConfig::default();
        file_config.apply(&mut config);
        if let Some(secs) = args.timeout {
            config.options.timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = args.max_output {
            config.options.max_output_bytes = bytes;
        }
        if let Some(jobs) = args.jobs {
            config.max_concurrency = jobs;
        }
        if args.fail_fast {
            config.fail_fast = true;
        }
        if let Some(dir) = &args.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        if args.no_cache {
            config.cache_dir = None;
        }

        for path in &args.plugins {
            if !path.exists() {
                bail!("Plugin path does not exist: {}", path.display());
            }
        }

        registry::initialize();
        {
            let mut registry = registry::global_mut()?;
            registry.set_policy(EnablePolicy {
                enable: file_config.enable.clone(),
                disable: file_config.disable.clone(),
                ignore_defaults: file_config.ignore_defaults,
            });
            for path in file_config.plugin_dirs.iter().chain(&args.plugins) {
                let report = registry.load_external(path);
                debug!(
                    path = %path.display(),
                    loaded = report.loaded.len(),
                    errors = report.errors.len(),
                    "Plugin manifests processed"
                );
            }
        }

        let engine = AnalysisEngine::new(config).context("Invalid engine configuration")?;
        let selection = Selection {
            names: (!args.analyzers.is_empty()).then(|| trimmed(&args.analyzers)),
            exclude: trimmed(&args.exclude),
        };

        Ok(Self {
            engine,
            selection,
            format: args.format,
            verbose: args.verbose > 0,
            db_path: args.db_path.clone(),
        })
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.engine.config().options
    }

    /// The named-snapshot store at the configured database path
    pub fn store(&self) -> Result<SnapshotStore> {
        let root = config::db_path(self.db_path.as_deref())?;
        debug!("Snapshot database: {}", root.display());
        Ok(SnapshotStore::new(root))
    }
}

fn trimmed(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

/// Read paths from stdin, one per line, skipping blanks and `#` comments
fn read_paths_from_stdin() -> Vec<PathBuf> {
    std::io::stdin()
        .lock()
        .lines()
        .map_while(std::result::Result::ok)
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(PathBuf::from)
        .collect()
}

/// Replace `-` with the paths read from stdin (read once)
pub(crate) fn expand_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut expanded = Vec::new();
    let mut stdin_read = false;
    for path in paths {
        if path == Path::new("-") {
            if !stdin_read {
                let from_stdin = read_paths_from_stdin();
                debug!("Read {} paths from stdin", from_stdin.len());
                expanded.extend(from_stdin);
                stdin_read = true;
            }
        } else {
            expanded.push(path.clone());
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_drops_blanks() {
        let names = vec![" what".to_string(), "".to_string(), "dump-h ".to_string()];
        assert_eq!(trimmed(&names), vec!["what", "dump-h"]);
    }

    #[test]
    fn test_expand_paths_without_stdin() {
        let paths = vec![PathBuf::from("/a.o"), PathBuf::from("/b.o")];
        assert_eq!(expand_paths(&paths), paths);
    }
}
