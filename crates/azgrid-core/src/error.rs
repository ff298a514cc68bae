//! Core error types.

use thiserror::Error;

/// Errors from manifest and template handling.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("could not resolve home directory")]
    NoHomeDir,

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
