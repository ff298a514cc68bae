//! Manager error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// The worker's cookie did not match this cluster's cookie.
    #[error("invalid cookie")]
    InvalidCookie,

    #[error("malformed worker greeting: {0}")]
    Handshake(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Azure(#[from] azgrid_azure::AzureError),

    #[error(transparent)]
    Scaleset(#[from] azgrid_scaleset::ScalesetError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
