mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use xcoffscan::registry;

fn main() -> Result<()> {
    // Parse args early to get verbose flag for logging initialization
    let args = cli::Args::parse();

    // RUST_LOG wins over -v; e.g. RUST_LOG=xcoffscan::engine=trace
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match args.verbose {
            0 => EnvFilter::new("xcoffscan=info"),
            1 => EnvFilter::new("xcoffscan=debug"),
            _ => EnvFilter::new("xcoffscan=trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    debug!("Logging initialized (verbose={})", args.verbose);

    if args.output.is_some() || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let session = commands::Session::from_args(&args)?;

    let result = match &args.command {
        cli::Command::Snapshot {
            files,
            name,
            description,
            strict,
        } => commands::snapshot::run(
            &session,
            files,
            name.as_deref(),
            description.as_deref(),
            *strict,
        ),
        cli::Command::Compare {
            file1,
            file2,
            against,
            summary,
        } => commands::compare::run(&session, file1, file2.as_ref(), against.as_deref(), *summary),
        cli::Command::Diff {
            name1,
            name2,
            file,
            summary,
        } => commands::diff::run(&session, name1, name2, file.as_deref(), *summary),
        cli::Command::Info { file } => commands::info::info(&session, file),
        cli::Command::Validate { file } => commands::info::validate(&session, file),
        cli::Command::List { name, delete } => commands::list::run(&session, name.as_deref(), *delete),
        cli::Command::Analyzers { check } => commands::analyzers::run(&session, *check),
    };
    registry::shutdown();
    let output = result?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", output.text))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Output written to {}", path.display());
        }
        None if !output.text.is_empty() => println!("{}", output.text),
        None => {}
    }

    if output.exit_code != 0 {
        std::process::exit(output.exit_code);
    }
    Ok(())
}
