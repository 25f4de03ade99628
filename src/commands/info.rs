//! Header inspection commands: `info` shows the details, `validate` gives a verdict.

use super::{CommandOutput, Session};
use anyhow::Result;
use std::path::Path;
use xcoffscan::output::{self, OutputFormat};
use xcoffscan::validate;

pub(crate) fn info(session: &Session, file: &Path) -> Result<CommandOutput> {
    let report = validate::validate(file);
    let text = output::format_validation(&report, session.format)?;
    Ok(CommandOutput::new(text, if report.valid { 0 } else { 1 }))
}

pub(crate) fn validate(session: &Session, file: &Path) -> Result<CommandOutput> {
    let report = validate::validate(file);
    let text = match (session.format, &report.file_type) {
        (OutputFormat::Text, Some(file_type)) if report.valid => {
            format!("{}: valid {}", file.display(), file_type)
        }
        (OutputFormat::Text, _) => format!(
            "{}: invalid - {}",
            file.display(),
            report.error.as_deref().unwrap_or("unknown error")
        ),
        (format, _) => output::format_validation(&report, format)?,
    };
    Ok(CommandOutput::new(text, if report.valid { 0 } else { 1 }))
}
