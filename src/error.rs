//! Error types for the sync core.

/// Main error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection is not active")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl SyncError {
    /// Whether the connection layer retries this error on its own.
    /// Logical failures are always surfaced to the caller instead.
    pub fn is_retried(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

// From conversions for common error types

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("JSON error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_retried() {
        assert!(SyncError::Connection("refused".into()).is_retried());
        assert!(!SyncError::NotConnected.is_retried());
        assert!(!SyncError::Authorization("nope".into()).is_retried());
        assert!(!SyncError::Validation("empty".into()).is_retried());
        assert!(!SyncError::State("terminal".into()).is_retried());
    }
}
