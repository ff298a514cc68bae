//! Error types for Azure-facing operations.

use thiserror::Error;

/// Errors from Azure REST calls and the surrounding loops.
#[derive(Debug, Error)]
pub enum AzureError {
    /// Any management-plane response with status >= 300, promoted to a
    /// typed error so the retry policy can classify it.
    #[error("azure returned status {status}: {body}")]
    Status {
        status: u16,
        /// Integer seconds from a `retry-after` response header, when present.
        retry_after: Option<u64>,
        body: String,
    },

    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected response shape: {0}")]
    Malformed(String),

    /// A wait loop was interrupted by the user.
    #[error("interrupted")]
    Interrupted,
}

impl AzureError {
    /// The HTTP status, for `Status` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            AzureError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for a 404 — delete polls treat this as success.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

pub type AzureResult<T> = Result<T, AzureError>;
