//! Diff command: compare two stored snapshot sets, or one file across them.

use super::{CommandOutput, Session};
use anyhow::{anyhow, bail, Result};
use xcoffscan::compare::{compare_sets, compare_snapshots};
use xcoffscan::output;
use xcoffscan::registry;

pub(crate) fn run(
    session: &Session,
    name1: &str,
    name2: &str,
    file: Option<&str>,
    summary_only: bool,
) -> Result<CommandOutput> {
    let registry = registry::global()?;
    let store = session.store()?;

    let known: Vec<String> = store.list_snapshots()?.into_iter().map(|s| s.name).collect();
    for name in [name1, name2] {
        if !known.iter().any(|k| k == name) {
            bail!("No stored snapshot set named '{}'", name);
        }
    }

    let text = match file {
        Some(file) => {
            let load = |name: &str| -> Result<_> {
                store
                    .load(name, file)?
                    .ok_or_else(|| anyhow!("No snapshot '{}' for {}", name, file))
            };
            let comparison = compare_snapshots(&registry, &load(name1)?, &load(name2)?, session.options());
            output::format_comparison(&comparison, session.format, summary_only)?
        }
        None => {
            let result = compare_sets(&registry, &store, name1, name2, session.options())?;
            output::format_set_comparison(&result, session.format)?
        }
    };
    Ok(CommandOutput::ok(text))
}
