//! azgrid-azure — the Azure-facing plumbing.
//!
//! Everything that talks HTTP to Azure goes through here: the bearer-
//! authenticated management client, the retry policy that absorbs
//! transient cloud errors, the instance-metadata service (image
//! discovery, preemption notice), and the compute quota checker.

pub mod client;
pub mod error;
pub mod metadata;
pub mod quota;
pub mod retry;
pub mod session;

pub use client::AzureClient;
pub use error::{AzureError, AzureResult};
pub use metadata::InstanceMetadata;
pub use quota::{quota_check, wait_for_quota, QuotaAvailability};
pub use retry::{retryable, with_retry};
pub use session::{EnvSession, Session, SessionProvider, StaticToken};
