//! Snapshot command: run the engine over each file and optionally store the results.

use super::{expand_paths, CommandOutput, Session};
use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing::info;
use xcoffscan::error::Error;
use xcoffscan::output;
use xcoffscan::registry;
use xcoffscan::validate;

/// Exits 0 when at least one snapshot was produced.
pub(crate) fn run(
    session: &Session,
    files: &[PathBuf],
    name: Option<&str>,
    description: Option<&str>,
    strict: bool,
) -> Result<CommandOutput> {
    let files = expand_paths(files);
    if files.is_empty() {
        bail!("No files to analyze (stdin was empty or contained only comments)");
    }

    let registry = registry::global()?;
    let store = name.map(|_| session.store()).transpose()?;
    let mut snapshots = Vec::new();

    for file in &files {
        if strict {
            if let Err(e) = validate::require_valid(file) {
                eprintln!("Error: {}", e);
                continue;
            }
        }

        let mut snapshot = match session.engine.run(&registry, file, &session.selection) {
            Ok(snapshot) => snapshot,
            Err(e @ (Error::TargetNotFound { .. } | Error::InvalidInput { .. })) => {
                eprintln!("Error: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if let (Some(store), Some(name)) = (&store, name) {
            let path = store.store(name, &snapshot, description)?;
            info!("Stored {} -> {} ({})", file.display(), name, path.display());
            snapshot.name = Some(name.to_string());
        }
        snapshots.push(snapshot);
    }

    let text = output::format_snapshots(&snapshots, session.format, session.verbose)?;
    let exit_code = if snapshots.is_empty() { 1 } else { 0 };
    Ok(CommandOutput::new(text, exit_code))
}
