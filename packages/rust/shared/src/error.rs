//! Error types for DocDrift.
//!
//! Library crates use [`DocDriftError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all DocDrift operations.
#[derive(Debug, thiserror::Error)]
pub enum DocDriftError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the language model or search backend.
    #[error("network error: {0}")]
    Network(String),

    /// An external call did not finish within its deadline.
    #[error("timeout: {operation} did not complete within {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Malformed or schema-violating model response.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A proposal cited messages outside its conversation.
    #[error("provenance error: proposal for {target} cites foreign message ids {foreign:?}")]
    Provenance {
        target: String,
        foreign: Vec<String>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocDriftError>;

impl DocDriftError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failed operation is safe to retry on the next tick as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout { .. } | Self::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DocDriftError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = DocDriftError::validation("unknown field `extra`");
        assert!(err.to_string().contains("unknown field"));

        let err = DocDriftError::timeout("classification", std::time::Duration::from_secs(2));
        assert_eq!(
            err.to_string(),
            "timeout: classification did not complete within 2000ms"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(DocDriftError::Network("reset".into()).is_transient());
        assert!(DocDriftError::Storage("locked".into()).is_transient());
        assert!(!DocDriftError::validation("bad json").is_transient());
        assert!(
            !DocDriftError::Provenance {
                target: "guide/setup".into(),
                foreign: vec!["m9".into()],
            }
            .is_transient()
        );
    }
}
