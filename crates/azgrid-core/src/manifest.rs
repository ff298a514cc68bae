//! The user manifest — account and subscription defaults.
//!
//! Lives at `~/.azmanagers/manifest.json` with owner-only permissions.
//! Operations that omit a subscription, resource group, or SSH identity
//! fall back to the values recorded here. The manifest is read once per
//! process and treated as read-mostly configuration.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Directory under the user's home that holds the manifest and the
/// template catalogs.
pub const CONFIG_DIR: &str = ".azmanagers";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resourcegroup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptionid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key_file: Option<String>,
}

static SHARED: OnceLock<Manifest> = OnceLock::new();

impl Manifest {
    /// The configuration directory, `~/.azmanagers`.
    pub fn dir() -> CoreResult<PathBuf> {
        let home = dirs::home_dir().ok_or(CoreError::NoHomeDir)?;
        Ok(home.join(CONFIG_DIR))
    }

    fn path() -> CoreResult<PathBuf> {
        Ok(Self::dir()?.join("manifest.json"))
    }

    /// Load the manifest from disk. A missing file yields the default
    /// (all-None) manifest.
    pub fn load() -> CoreResult<Self> {
        let path = Self::path()?;
        if !path.exists() {
            debug!(?path, "no manifest on disk, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// The process-wide manifest, read from disk on first access.
    pub fn shared() -> &'static Manifest {
        SHARED.get_or_init(|| Manifest::load().unwrap_or_default())
    }

    /// Persist the manifest with owner-only permissions (directory 0700,
    /// file 0600).
    pub fn save(&self) -> CoreResult<()> {
        let dir = Self::dir()?;
        std::fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700)?;
        let path = Self::path()?;
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        restrict_permissions(&path, 0o600)?;
        debug!(?path, "manifest saved");
        Ok(())
    }

    /// Pick `value` when given, else the manifest default for the
    /// subscription id.
    pub fn subscription_or<'a>(&'a self, value: Option<&'a str>) -> Option<&'a str> {
        value.or(self.subscriptionid.as_deref())
    }

    /// Pick `value` when given, else the manifest default for the
    /// resource group.
    pub fn resource_group_or<'a>(&'a self, value: Option<&'a str>) -> Option<&'a str> {
        value.or(self.resourcegroup.as_deref())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
