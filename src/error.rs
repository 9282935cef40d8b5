//! Error types for vectis
//!
//! All modules use `VectisResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for vectis operations
pub type VectisResult<T> = Result<T, VectisError>;

/// All errors that can occur in vectis
#[derive(Error, Debug)]
pub enum VectisError {
    // Backend / protocol errors
    #[error("Virtualization backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Protocol error from {backend}: {request} -> {response}")]
    ProtocolError {
        backend: String,
        request: String,
        response: String,
    },

    #[error("Timed out after {seconds}s: {operation}")]
    TimeoutError { operation: String, seconds: u64 },

    #[error("Transfer failed: {from} -> {to}: {reason}")]
    TransferError {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Operation not supported by backend {backend}: {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("Worker is {state}, cannot {operation}")]
    InvalidState { state: String, operation: String },

    // Artifact errors
    #[error("Missing dependency for {stage}: {needed} is not in the artifact store")]
    MissingDependency { stage: String, needed: String },

    #[error("Incomplete artifact build for {key}: {reason}")]
    ArtifactBuildIncomplete { key: String, reason: String },

    // Build outcome
    #[error("Command failed with exit status {exit_code}: {command}\n{stderr}")]
    BuildFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Stage {stage} failed for {suite}: {source}")]
    StageFailed {
        stage: String,
        suite: String,
        #[source]
        source: Box<VectisError>,
    },

    #[error("Cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown suite {vendor}/{suite}")]
    SuiteNotFound { vendor: String, suite: String },

    #[error("Suite {vendor}/{suite} has a cyclic base chain: {chain}")]
    SuiteCycle {
        vendor: String,
        suite: String,
        chain: String,
    },

    #[error("No mirror configured for {0}")]
    NoMirror(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl VectisError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a protocol error for an unexpected response line
    pub fn protocol(
        backend: impl Into<String>,
        request: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self::ProtocolError {
            backend: backend.into(),
            request: request.into(),
            response: response.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer(
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TransferError {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Attach stage and suite context to an error
    pub fn in_stage(self, stage: impl Into<String>, suite: impl Into<String>) -> Self {
        match self {
            // Already carries its context
            Self::StageFailed { .. } | Self::Cancelled => self,
            other => Self::StageFailed {
                stage: stage.into(),
                suite: suite.into(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error, looking through stage context
    pub fn cause(&self) -> &VectisError {
        match self {
            Self::StageFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Check if error is retryable
    ///
    /// Only transfers are retried, and only a bounded number of times.
    pub fn is_retryable(&self) -> bool {
        matches!(self.cause(), Self::TransferError { .. })
    }

    /// Whether the worker session must not be used after this error
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self.cause(),
            Self::ProtocolError { .. } | Self::TimeoutError { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.cause() {
            Self::BackendUnavailable { .. } => {
                Some("Install autopkgtest, or check the worker.backend setting")
            }
            Self::MissingDependency { .. } => {
                Some("Build the missing artifact first, e.g. with: vectis prepare --minbase")
            }
            Self::NoMirror(_) => Some("Set vendors.<vendor>.mirror in config.toml"),
            Self::SuiteCycle { .. } => Some("Check the base = ... entries in config.toml"),
            _ => None,
        }
    }
}
