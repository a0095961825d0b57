//! Error types for sentinel-audit

use thiserror::Error;

/// Errors that can occur while recording, evaluating, or triaging
#[derive(Debug, Error)]
pub enum AuditError {
    /// Durable store unreachable, failed, or exceeded its deadline
    ///
    /// Fatal to the request that triggered the audit write.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Referenced alert or event does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Triage status outside the enumerated set
    #[error("Invalid triage status: '{0}'")]
    InvalidStatus(String),

    /// Triage status is valid but the alert lifecycle forbids the move
    #[error("Invalid triage transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: String,
        to: String,
    },

    /// Audit input that does not have the minimal required shape
    #[error("Invalid audit event: {0}")]
    InvalidEvent(String),

    /// A single detection rule failed to evaluate
    #[error("Detection rule '{rule_id}' failed: {reason}")]
    Rule {
        rule_id: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuditError {
    /// Whether this error must fail the request that produced the audit event
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuditError::StorageUnavailable(_))
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        AuditError::StorageUnavailable(format!("{}: {}", context, err))
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;
