//! Analyzers command: what is registered, enabled, and runnable here.

use super::{CommandOutput, Session};
use anyhow::Result;
use xcoffscan::output::{self, AnalyzerListing};
use xcoffscan::registry;

pub(crate) fn run(session: &Session, check: bool) -> Result<CommandOutput> {
    let registry = registry::global()?;
    let listings: Vec<AnalyzerListing> = registry
        .list_all(false, None)
        .iter()
        .map(|analyzer| {
            let descriptor = analyzer.descriptor().clone();
            AnalyzerListing {
                enabled: registry.is_enabled(&descriptor.name),
                missing: check.then(|| analyzer.check_requirements()),
                descriptor,
            }
        })
        .collect();
    Ok(CommandOutput::ok(output::format_analyzers(&listings, session.format)?))
}
