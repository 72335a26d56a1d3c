//! Failure taxonomy for the panel core.
//!
//! Nothing here is fatal: every variant leaves the caller in its last
//! known-good state and is meant to be shown as a bounded warning.

use thiserror::Error;

/// The four failure classes a caller has to tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Remote call did not complete; retry is user-initiated.
    Transport,
    /// Payload did not match a recognized shape.
    Shape,
    /// Two round trips disagreed (e.g. promised column missing from schema).
    Consistency,
    /// User input rejected before any remote call.
    Validation,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PanelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {secs}s: {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("unrecognized payload: {0}")]
    Shape(String),

    #[error("consistency warning: {0}")]
    Consistency(String),

    #[error("{0}")]
    Validation(String),

    #[error("schema refresh already in progress for {filename}")]
    RefreshInFlight { filename: String },
}

impl PanelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PanelError::Transport(_) | PanelError::Timeout { .. } => ErrorKind::Transport,
            PanelError::Shape(_) => ErrorKind::Shape,
            PanelError::Consistency(_) => ErrorKind::Consistency,
            PanelError::Validation(_) | PanelError::RefreshInFlight { .. } => ErrorKind::Validation,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        true
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PanelError::Validation(msg.into())
    }
}

impl From<reqwest::Error> for PanelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PanelError::Timeout {
                operation: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
                secs: 0,
            }
        } else {
            PanelError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(err: serde_json::Error) -> Self {
        PanelError::Shape(err.to_string())
    }
}

impl From<url::ParseError> for PanelError {
    fn from(err: url::ParseError) -> Self {
        PanelError::Transport(format!("bad url: {}", err))
    }
}

pub type PanelResult<T> = std::result::Result<T, PanelError>;
