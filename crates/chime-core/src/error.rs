//! Error taxonomy shared by every Chime crate.

use thiserror::Error;

/// Errors produced by the reminder engine and its collaborators.
#[derive(Debug, Error)]
pub enum ChimeError {
    /// A timestamp could not be parsed. Carries the offending input.
    #[error("Invalid date format: '{0}'. Use ISO 8601 (e.g. 2025-01-01T10:00:00Z)")]
    MalformedTimestamp(String),

    #[error("Lead-time estimator unavailable: {0}")]
    EstimatorUnavailable(String),

    #[error("Item fetch failed: {0}")]
    ItemFetch(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChimeError {
    /// Whether the error should be shown to the user who submitted the input,
    /// as opposed to being logged and absorbed.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ChimeError::MalformedTimestamp(_) | ChimeError::Validation(_) | ChimeError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_timestamp_echoes_input() {
        let err = ChimeError::MalformedTimestamp("tomorrow-ish".into());
        assert!(err.to_string().contains("tomorrow-ish"));
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_internal_errors_not_user_facing() {
        assert!(!ChimeError::EstimatorUnavailable("timeout".into()).is_user_facing());
        assert!(!ChimeError::Delivery("closed".into()).is_user_facing());
    }
}
