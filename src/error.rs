//! Error type shared by the backend adapters, the sync gate and the pipeline.
//!
//! Row-level data problems never surface here: malformed amounts, dates and
//! names are defaulted where they are read. These variants describe failures
//! of a whole request or stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DashboardError {
    /// The backend could not be reached (connect failure, timeout, bad URL).
    #[error("{0}")]
    Network(String),

    /// The backend answered with a non-success HTTP status.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// The response body was not the JSON we asked for.
    #[error("Invalid response from backend: {0}")]
    Decode(String),

    /// Local SQLite backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The backend returned something that is not a list of table rows.
    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    #[error("A sync is already running")]
    SyncInProgress,

    #[error("Sync is cooling down, next sync available in {remaining}")]
    SyncCooldown { remaining: String },

    #[error("Sync endpoint rejected the request: {0}")]
    SyncTrigger(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DashboardError>;

impl From<reqwest::Error> for DashboardError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.as_str().to_string())
            .unwrap_or_else(|| "backend".to_string());
        if err.is_decode() {
            return DashboardError::Decode(err.to_string());
        }
        DashboardError::Network(crate::api::friendly_error(&url, &err))
    }
}

impl From<rusqlite::Error> for DashboardError {
    fn from(err: rusqlite::Error) -> Self {
        DashboardError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DashboardError {
    fn from(err: serde_json::Error) -> Self {
        DashboardError::Decode(err.to_string())
    }
}

impl DashboardError {
    /// Whether the failure came from talking to the backend rather than from
    /// our own state (cooldown, cancellation, configuration).
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            DashboardError::Network(_)
                | DashboardError::Http { .. }
                | DashboardError::Decode(_)
                | DashboardError::Storage(_)
                | DashboardError::UnexpectedPayload(_)
                | DashboardError::SyncTrigger(_)
        )
    }
}
