//! Unified error handling for spamsweep.
//!
//! A `thiserror`-based model with:
//!   * Typed variants for each failure domain of the pipeline
//!   * A categorization layer (`ErrorCategory`) used in metadata records
//!   * Helper constructors
//!   * `From` conversions for common lower-level errors
//!
//! Propagation rules:
//!   * `Parse` / `UnsupportedFormat` end processing of one email (`Failed`).
//!   * `Network`, `Timeout` and `Lookup` are caught by the stage that raised
//!     them and degrade into a `failure` / null result.
//!   * `Configuration` and `LedgerWrite` stop the whole batch.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// High-level classification for structured reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Parse,
    Network,
    Ledger,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Input => "input",
            ErrorCategory::Parse => "parse",
            ErrorCategory::Network => "network",
            ErrorCategory::Ledger => "ledger",
            ErrorCategory::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Primary error type.
#[derive(Error, Debug)]
pub enum SweepError {
    // ------------------------ Input / Validation ----------------------------
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Unsupported email container for {file_path}: {reason}")]
    UnsupportedFormat { file_path: String, reason: String },

    // ---------------------------- Parsing -----------------------------------
    #[error("Failed to parse {format} message: {reason}")]
    Parse { format: String, reason: String },

    // ----------------------------- Network ----------------------------------
    #[error("Network error during {operation} for '{target}': {reason}")]
    Network {
        operation: String,
        target: String,
        reason: String,
    },

    #[error("{operation} for '{target}' timed out after {millis}ms")]
    Timeout {
        operation: String,
        target: String,
        millis: u64,
    },

    #[error("WHOIS lookup for '{query}' failed: {reason}")]
    Lookup { query: String, reason: String },

    // ------------------------------ Ledger ----------------------------------
    #[error("Failed to write action ledger {path}: {source}")]
    LedgerWrite {
        path: String,
        #[source]
        source: io::Error,
    },

    // ----------------------------- I/O / FS ---------------------------------
    #[error("I/O error during {operation} on {path}: {source}")]
    Io {
        path: String,
        operation: String,
        #[source]
        source: io::Error,
    },

    // ---------------------------- Internal ----------------------------------
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SweepError {
    /// Categorize the error for structured output.
    pub fn category(&self) -> ErrorCategory {
        use SweepError::*;
        match self {
            Configuration { .. } | UnsupportedFormat { .. } => ErrorCategory::Input,
            Parse { .. } => ErrorCategory::Parse,
            Network { .. } | Timeout { .. } | Lookup { .. } => ErrorCategory::Network,
            LedgerWrite { .. } => ErrorCategory::Ledger,
            Io { .. } | Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Errors that must stop the batch instead of degrading one email.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            SweepError::LedgerWrite { .. } | SweepError::Configuration { .. }
        )
    }

    /// True for transient network conditions worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            SweepError::Timeout { .. } => true,
            SweepError::Network { reason, .. } => {
                let r = reason.to_ascii_lowercase();
                r.contains("connect")
                    || r.contains("reset")
                    || r.contains("refused")
                    || r.contains("unreachable")
                    || r.contains("temporar")
            }
            _ => false,
        }
    }

    // ---------------------------- Constructors -----------------------------

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported_format(file_path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            file_path: file_path.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(format: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            format: format.into(),
            reason: reason.into(),
        }
    }

    pub fn network(
        operation: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Network {
            operation: operation.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, target: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            target: target.into(),
            millis,
        }
    }

    pub fn lookup(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lookup {
            query: query.into(),
            reason: reason.into(),
        }
    }

    pub fn ledger_write(path: impl Into<String>, source: io::Error) -> Self {
        Self::LedgerWrite {
            path: path.into(),
            source,
        }
    }

    pub fn io(path: impl Into<String>, operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Public result alias.
pub type Result<T> = std::result::Result<T, SweepError>;

/// Map standard IO errors into `Io` variant (generic context).
impl From<io::Error> for SweepError {
    fn from(e: io::Error) -> Self {
        SweepError::Io {
            path: "<unknown>".into(),
            operation: "unspecified".into(),
            source: e,
        }
    }
}

impl From<ConfigError> for SweepError {
    fn from(e: ConfigError) -> Self {
        SweepError::Configuration {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for SweepError {
    fn from(e: serde_json::Error) -> Self {
        SweepError::internal_with("JSON serialization failed", e)
    }
}

/// Extension trait for enriching IO results with path + operation context.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<String>, operation: impl Into<String>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, io::Error> {
    fn with_path(self, path: impl Into<String>, operation: impl Into<String>) -> Result<T> {
        self.map_err(|e| SweepError::io(path.into(), operation.into(), e))
    }
}
