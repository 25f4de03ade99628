//! Compare command: two files (or snapshot documents), or one file against a stored set.

use super::{CommandOutput, Session};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use xcoffscan::compare::compare_snapshots;
use xcoffscan::output;
use xcoffscan::registry::{self, Registry};
use xcoffscan::snapshot::Snapshot;

/// Exits 1 when the two sides differ.
pub(crate) fn run(
    session: &Session,
    file1: &Path,
    file2: Option<&PathBuf>,
    against: Option<&str>,
    summary_only: bool,
) -> Result<CommandOutput> {
    let registry = registry::global()?;
    let current = snapshot_of(session, &registry, file1)?;

    let (old, new) = match (against, file2) {
        (Some(name), _) => {
            let stored = session
                .store()?
                .load(name, &current.filepath)?
                .ok_or_else(|| anyhow!("No stored snapshot '{}' for {}", name, current.filepath))?;
            (stored, current)
        }
        (None, Some(file2)) => (current, snapshot_of(session, &registry, file2)?),
        (None, None) => return Err(anyhow!("Need --against NAME or a second file")),
    };

    let comparison = compare_snapshots(&registry, &old, &new, session.options());
    let text = output::format_comparison(&comparison, session.format, summary_only)?;
    let exit_code = if comparison.has_differences { 1 } else { 0 };
    Ok(CommandOutput::new(text, exit_code))
}

/// A `.json` path is read as a saved snapshot; anything else is analyzed
fn snapshot_of(session: &Session, registry: &Registry, path: &Path) -> Result<Snapshot> {
    if path.extension().is_some_and(|e| e == "json") {
        Snapshot::load(path).with_context(|| format!("Failed to read snapshot {}", path.display()))
    } else {
        session
            .engine
            .run(registry, path, &session.selection)
            .with_context(|| format!("Failed to analyze {}", path.display()))
    }
}
