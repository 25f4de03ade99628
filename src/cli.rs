use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use xcoffscan::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "xcoffscan")]
#[command(about = "XCOFF analysis and comparison tool for AIX and IBM i PASE")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    /// Write output to file
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Verbose logging (repeat for more detail)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Comma-separated analyzers to run (default: all enabled)
    #[arg(short = 'a', long, value_delimiter = ',', global = true)]
    pub analyzers: Vec<String>,

    /// Comma-separated analyzers to leave out
    #[arg(short = 'x', long, value_delimiter = ',', global = true)]
    pub exclude: Vec<String>,

    /// Per-analyzer timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Maximum bytes read from one tool's output
    #[arg(long, global = true)]
    pub max_output: Option<u64>,

    /// Analyzers run in parallel (concurrent-safe ones only)
    #[arg(short = 'j', long, global = true)]
    pub jobs: Option<usize>,

    /// Stop launching analyzers after the first failure
    #[arg(long, global = true)]
    pub fail_fast: bool,

    /// Snapshot database (default: $XCOFF_DB_PATH or ~/.xcoffscandb)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Config file (default: <config dir>/xcoffscan/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Load plugin manifests from a file or directory (repeatable)
    #[arg(long = "plugins", value_name = "PATH", global = true)]
    pub plugins: Vec<PathBuf>,

    /// Cache analyzer results in this directory
    #[arg(long, global = true, conflicts_with = "no_cache")]
    pub cache_dir: Option<PathBuf>,

    /// Disable the result cache even when configured
    #[arg(long, global = true)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture analysis snapshots of XCOFF files
    Snapshot {
        /// XCOFF objects or archives to analyze
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Store the snapshots under this name (e.g. aix73, baseline)
        #[arg(short, long, alias = "store")]
        name: Option<String>,

        /// Description recorded for the stored set
        #[arg(short, long, requires = "name")]
        description: Option<String>,

        /// Skip files whose header does not validate
        #[arg(long)]
        strict: bool,
    },

    /// Compare two files, or a file against a stored snapshot
    Compare {
        /// Object file or snapshot .json document
        file1: PathBuf,

        /// Second object file or snapshot .json document
        #[arg(required_unless_present = "against", conflicts_with = "against")]
        file2: Option<PathBuf>,

        /// Compare FILE1 against its snapshot in this stored set
        #[arg(long, value_name = "NAME")]
        against: Option<String>,

        /// Show only the summary
        #[arg(long, alias = "summary-only")]
        summary: bool,
    },

    /// Compare two stored snapshot sets
    Diff {
        name1: String,
        name2: String,

        /// Compare only this file
        file: Option<String>,

        /// Show only the summary
        #[arg(long, alias = "summary-only")]
        summary: bool,
    },

    /// Show header details of an XCOFF file
    Info { file: PathBuf },

    /// Check whether a file is a valid XCOFF object or archive
    Validate { file: PathBuf },

    /// List stored snapshot sets, or the files in one set
    List {
        /// Set to list the files of
        name: Option<String>,

        /// Delete the named set
        #[arg(long, requires = "name")]
        delete: bool,
    },

    /// List registered analyzers
    Analyzers {
        /// Check that the commands each analyzer needs are on PATH
        #[arg(long)]
        check: bool,
    },
}
