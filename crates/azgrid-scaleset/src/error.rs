//! Provisioning error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScalesetError {
    #[error(transparent)]
    Azure(#[from] azgrid_azure::AzureError),

    #[error("template error: {0}")]
    Template(String),

    /// Azure reported `provisioningState == Failed`. Fatal for the
    /// operation; the portal has the diagnostics.
    #[error("provisioning failed for {0}: check the Azure portal")]
    Provision(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

pub type ScalesetResult<T> = Result<T, ScalesetError>;
