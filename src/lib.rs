//! xcoffscan - snapshot and compare XCOFF objects and archives.
//!
//! Analyzers wrap the AIX inspection tools (`what`, `dump`, `ar`), run them
//! under time and output bounds, and record their structured results in a
//! [`Snapshot`]. Two snapshots of the same file, taken on different systems
//! or at different times, can then be compared analyzer by analyzer.
//!
//! # Example
//!
//! ```no_run
//! use xcoffscan::{AnalysisEngine, EngineConfig, Registry, Selection};
//! use std::path::Path;
//!
//! let registry = Registry::with_builtins();
//! let engine = AnalysisEngine::new(EngineConfig::default()).unwrap();
//! let snapshot = engine
//!     .run(&registry, Path::new("/usr/lib/libc.a"), &Selection::all_enabled())
//!     .unwrap();
//!
//! for (name, outcome) in &snapshot.results {
//!     println!("{}: success={}", name, outcome.success);
//! }
//! ```

pub mod accumulator;
pub mod analyzers;
pub mod cache;
pub mod compare;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod process;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod validate;

// Re-export commonly used types at crate root
pub use analyzers::{Analyzer, AnalyzerDescriptor, Capability};
pub use compare::{compare_snapshots, compare_sorted, DiffStats, RecordDiff, SnapshotComparison};
pub use config::{AnalyzerOptions, EngineConfig};
pub use engine::{AnalysisEngine, Selection};
pub use error::{Error, Result};
pub use registry::Registry;
pub use snapshot::{AnalysisOutcome, ComparisonOutcome, Snapshot};
pub use store::SnapshotStore;
pub use validate::{FileType, ValidationReport};

use std::path::Path;

/// Snapshot one file with the built-in analyzers and default settings
pub fn snapshot_file(path: impl AsRef<Path>) -> Result<Snapshot> {
    let registry = Registry::with_builtins();
    let engine = AnalysisEngine::new(EngineConfig::default())?;
    engine.run(&registry, path.as_ref(), &Selection::all_enabled())
}
