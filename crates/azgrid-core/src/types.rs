//! Data types shared across the AzGrid crates.

use serde::{Deserialize, Serialize};

/// Length of the ASCII cookie a worker sends first on its handshake
/// socket, right-padded with spaces.
pub const HDR_COOKIE_LEN: usize = 16;

/// Port the detached-job service listens on.
pub const DETACHED_SERVICE_PORT: u16 = 8081;

/// Identity of a managed scale set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScaleSetKey {
    pub subscription: String,
    pub resource_group: String,
    pub scaleset: String,
}

impl ScaleSetKey {
    pub fn new(subscription: &str, resource_group: &str, scaleset: &str) -> Self {
        Self {
            subscription: subscription.to_string(),
            resource_group: resource_group.to_string(),
            scaleset: scaleset.to_string(),
        }
    }
}

impl std::fmt::Display for ScaleSetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.subscription, self.resource_group, self.scaleset
        )
    }
}

/// Azure placement metadata a worker reports about itself.
///
/// Carried through the handshake, kept on the worker's config, and
/// consulted when the worker is killed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerUserdata {
    pub subscriptionid: String,
    pub resourcegroup: String,
    pub scalesetname: String,
    pub instanceid: String,
    pub name: String,
    #[serde(default)]
    pub mpi: bool,
    #[serde(default)]
    pub mpi_size: u32,
}

impl WorkerUserdata {
    pub fn scaleset_key(&self) -> ScaleSetKey {
        ScaleSetKey::new(&self.subscriptionid, &self.resourcegroup, &self.scalesetname)
    }
}

/// The self-description a worker sends after its cookie: one
/// newline-terminated base64 line decoding to this JSON shape.
///
/// `userdata` is absent for secondary processes sharing a VM with a
/// primary worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerGreeting {
    pub bind_addr: String,
    pub ppi: u32,
    #[serde(default)]
    pub userdata: Option<WorkerUserdata>,
}

/// Identity of a standalone VM hosting the detached-job service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedVm {
    pub name: String,
    pub ip: String,
    pub subscriptionid: String,
    pub resourcegroup: String,
}
