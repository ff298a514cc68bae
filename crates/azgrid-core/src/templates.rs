//! Template catalogs — user-authored Azure resource templates.
//!
//! Three catalogs live next to the manifest, each a JSON object keyed
//! by template name: `templates_scaleset.json`, `templates_vm.json`,
//! and `templates_nic.json`. Templates are kept as raw JSON trees so
//! deeply nested fields (image reference, SSH keys, custom data) can be
//! patched in place before submission.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;

/// One catalog entry: the resource body plus the first-boot temp-disk
/// preamble (mkfs/mount commands) injected ahead of the startup script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub tempdisk: String,
    pub value: Value,
}

/// Which catalog file a template belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateCatalog {
    ScaleSet,
    Vm,
    Nic,
}

impl TemplateCatalog {
    fn file_name(self) -> &'static str {
        match self {
            TemplateCatalog::ScaleSet => "templates_scaleset.json",
            TemplateCatalog::Vm => "templates_vm.json",
            TemplateCatalog::Nic => "templates_nic.json",
        }
    }

    fn path(self) -> CoreResult<PathBuf> {
        Ok(Manifest::dir()?.join(self.file_name()))
    }

    /// Load the whole catalog. A missing file is an empty catalog.
    pub fn load(self) -> CoreResult<HashMap<String, Template>> {
        let path = self.path()?;
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Fetch one template by name.
    pub fn get(self, name: &str) -> CoreResult<Template> {
        self.load()?
            .remove(name)
            .ok_or_else(|| CoreError::TemplateNotFound(name.to_string()))
    }

    /// Insert or replace a template and write the catalog back with
    /// owner-only permissions.
    pub fn save(self, name: &str, template: Template) -> CoreResult<()> {
        let dir = Manifest::dir()?;
        std::fs::create_dir_all(&dir)?;
        let mut catalog = self.load()?;
        catalog.insert(name.to_string(), template);
        let path = self.path()?;
        std::fs::write(&path, serde_json::to_string_pretty(&catalog)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
