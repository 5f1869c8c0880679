// Error handling framework for the dashboard engine
// Typed errors for the remote boundary, local validation and filter predicates

use std::time::Duration;
use thiserror::Error;

/// Errors raised at the remote control plane boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Control plane returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request to control plane failed: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response from control plane: {0}")]
    Decode(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ClientError {
    /// 401 responses form their own class and are surfaced, never retried
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured value here
            ClientError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                ClientError::Unauthorized(err.to_string())
            } else {
                ClientError::Status {
                    status: status.as_u16(),
                    body: err.to_string(),
                }
            }
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

/// Validation errors raised locally, before any remote call is made
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("No items selected")]
    EmptySelection,

    #[error("Item {item} is not eligible: {reason}")]
    NotEligible { item: String, reason: String },
}

/// Errors returned by filter predicates on malformed record data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Malformed value for field {field}: {reason}")]
    Malformed { field: String, reason: String },
}

/// Bulk operation errors. Per-item failures are tallied, not raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BulkError {
    #[error("Bulk request rejected: {0}")]
    Rejected(#[from] ValidationError),
}

/// Severity of a user-facing alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// A user-facing notification produced by the fetch layer or a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    /// Timed alerts disappear on their own; authentication failures stay until dismissed
    pub expires: bool,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            expires: true,
        }
    }

    pub fn sticky(mut self) -> Self {
        self.expires = false;
        self
    }

    /// Surface a user-initiated fetch failure
    pub fn from_client_error(err: &ClientError) -> Self {
        if err.is_unauthorized() {
            Alert::new(
                AlertLevel::Error,
                "Authentication failed. Please sign in again.",
            )
            .sticky()
        } else {
            Alert::new(AlertLevel::Error, err.to_string())
        }
    }
}
