//! Error types for topology translation and execution.
//!
//! Every failure in the engine is fatal for the current run. Errors are
//! still categorized so callers can give the user appropriate feedback,
//! but nothing in this crate retries: recovery is re-invocation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Categories of failures, one per stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad topology or configuration, detected before anything executes
    Input,
    /// An intrinsic function or selector could not be evaluated
    Resolution,
    /// The executor reported a failed or unreachable instruction
    Execution,
    /// Session handling or completion messages were malformed
    Protocol,
    /// Filesystem or serialization failure
    Io,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Input => "Invalid topology or configuration",
            Self::Resolution => "Value resolution failed",
            Self::Execution => "Remote execution failed",
            Self::Protocol => "Executor protocol error",
            Self::Io => "I/O error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Input => "Fix the template or the configuration file and run again",
            Self::Resolution => {
                "Check that referenced inputs, properties and attributes are declared"
            }
            Self::Execution => {
                "Inspect the failed task; created resources stay recorded for a delete run"
            }
            Self::Protocol => "Check that the executor endpoint is reachable and compatible",
            Self::Io => "Check file permissions and the state directory",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur while translating or running a topology.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration value
    #[error("configuration parameter '{key}' is missing or invalid: {message}")]
    Config {
        /// Dotted key of the parameter
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// Malformed topology document
    #[error("invalid topology: {0}")]
    Topology(String),

    /// A type lists itself as its parent
    #[error("invalid type '{0}' is derived from itself")]
    SelfDerivedType(String),

    /// A type definition referenced by a template or parent is unknown
    #[error("type definition not found: {0}")]
    UnknownType(String),

    /// A relationship or requirement points at a resource that is not declared
    #[error("'{from}' references undeclared resource '{target}'")]
    UndeclaredTarget {
        /// Referencing resource or relationship
        from: String,
        /// Missing resource name
        target: String,
    },

    /// The operation graph contains a cycle
    #[error("dependency cycle detected involving: {0}")]
    Cycle(String),

    /// Unknown target automation tool
    #[error("configuration tool '{name}' wasn't found, possible values: {known}")]
    UnknownTool {
        /// Requested tool name
        name: String,
        /// Comma-separated supported names
        known: String,
    },

    /// Missing topology input without default
    #[error("input '{0}' has no value and no default")]
    MissingInput(String),

    /// Intrinsic function evaluation failed
    #[error("cannot resolve {function} in '{context}': {message}")]
    Resolution {
        /// Function name (get_attribute, token, ...)
        function: String,
        /// Resource the expression belongs to
        context: String,
        /// What went wrong
        message: String,
    },

    /// A resource has no recorded instance state
    #[error("node or relationship '{name}' has no recorded state in cluster '{cluster}'")]
    StateNotFound {
        /// Cluster identifier
        cluster: String,
        /// Resource name
        name: String,
    },

    /// An instruction failed or its host was unreachable
    #[error("task '{task}' of {operation} failed: {message}")]
    TaskFailed {
        /// Operation key, `resource:operation`
        operation: String,
        /// Task name reported by the executor
        task: String,
        /// First non-empty of stderr, msg, stdout, raw facts
        message: String,
    },

    /// Session start/init/stop failed or a message had the wrong shape
    #[error("executor protocol error: {0}")]
    Protocol(String),

    /// HTTP transport error
    #[error("HTTP error: {message}")]
    Http {
        /// Error message
        message: String,
        /// Status code, when the server answered
        status: Option<u16>,
    },

    /// IO error with path context
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path that was accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a resolution error.
    pub fn resolution(
        function: impl Into<String>,
        context: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            function: function.into(),
            context: context.into(),
            message: message.into(),
        }
    }

    /// Get the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config { .. }
            | Error::Topology(_)
            | Error::SelfDerivedType(_)
            | Error::UnknownType(_)
            | Error::UndeclaredTarget { .. }
            | Error::Cycle(_)
            | Error::UnknownTool { .. } => ErrorCategory::Input,
            Error::MissingInput(_) | Error::Resolution { .. } | Error::StateNotFound { .. } => {
                ErrorCategory::Resolution
            }
            Error::TaskFailed { .. } => ErrorCategory::Execution,
            Error::Protocol(_) | Error::Http { .. } => ErrorCategory::Protocol,
            Error::Io { .. } | Error::Json(_) | Error::Yaml(_) | Error::Toml(_) => {
                ErrorCategory::Io
            }
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Http {
                message: format!("HTTP {}", code),
                status: Some(code),
            },
            other => Self::Http {
                message: other.to_string(),
                status: None,
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
