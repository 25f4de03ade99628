use std::path::PathBuf;
use thiserror::Error;

/// Error kinds that are not attributable to a single analyzer.
///
/// Analyzer-level failures (missing tools, timeouts, non-zero exits) never
/// surface here; they are recorded in the analyzer's `AnalysisOutcome`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Target does not exist: {path}")]
    TargetNotFound { path: PathBuf },

    #[error("Invalid input file {path}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    #[error("Analyzer already registered: {name}")]
    DuplicateAnalyzer { name: String },

    #[error("Unknown analyzer: {name}")]
    AnalyzerNotFound { name: String },

    #[error("Analyzer registry has not been initialized")]
    RegistryNotInitialized,

    #[error("Plugin {source_name} failed to load: {message}")]
    PluginLoad { source_name: String, message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Process error: {0}")]
    Process(#[from] crate::process::ProcessError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn target_not_found<P: Into<PathBuf>>(path: P) -> Self {
        Self::TargetNotFound { path: path.into() }
    }

    pub fn invalid_input<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::InvalidInput { path: path.into(), reason: reason.into() }
    }

    pub fn duplicate_analyzer<S: Into<String>>(name: S) -> Self {
        Self::DuplicateAnalyzer { name: name.into() }
    }

    pub fn analyzer_not_found<S: Into<String>>(name: S) -> Self {
        Self::AnalyzerNotFound { name: name.into() }
    }

    pub fn plugin_load<S1: Into<String>, S2: Into<String>>(source_name: S1, message: S2) -> Self {
        Self::PluginLoad { source_name: source_name.into(), message: message.into() }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns true if a batch over several files can move on to the next file
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TargetNotFound { .. } | Self::InvalidInput { .. } | Self::Io(_) | Self::Process(_)
        )
    }
}
