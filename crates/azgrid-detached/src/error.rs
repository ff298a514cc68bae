//! Detached-job error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetachedError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Azure(#[from] azgrid_azure::AzureError),

    #[error(transparent)]
    Scaleset(#[from] azgrid_scaleset::ScalesetError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The detached service answered with an error status.
    #[error("detached service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("timed out: {0}")]
    Timeout(String),
}

pub type DetachedResult<T> = Result<T, DetachedError>;
