//! List command: stored snapshot sets, the files of one set, or delete a set.

use super::{CommandOutput, Session};
use anyhow::{bail, Result};
use xcoffscan::output::{self, OutputFormat};

pub(crate) fn run(session: &Session, name: Option<&str>, delete: bool) -> Result<CommandOutput> {
    let store = session.store()?;

    let Some(name) = name else {
        let sets = store.list_snapshots()?;
        return Ok(CommandOutput::ok(output::format_stored_sets(&sets, session.format)?));
    };

    if delete {
        if !store.delete(name)? {
            bail!("No stored snapshot set named '{}'", name);
        }
        return Ok(CommandOutput::ok(format!("Deleted snapshot set '{}'", name)));
    }

    let files = store.list_files(name)?;
    if files.is_empty() && session.format == OutputFormat::Text {
        return Ok(CommandOutput::new(format!("No files in snapshot '{}'", name), 1));
    }
    let exit_code = if files.is_empty() { 1 } else { 0 };
    Ok(CommandOutput::new(
        output::format_stored_files(name, &files, session.format)?,
        exit_code,
    ))
}
