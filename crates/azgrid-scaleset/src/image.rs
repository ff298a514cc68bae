//! Boot image resolution.
//!
//! A template carries an `imageReference.id`; the user can override it
//! with a gallery image (name + optional version) or a plain image
//! name. When nothing is supplied and the master itself runs on Azure,
//! the image it booted from is discovered through instance metadata and
//! reused for the workers.

use azgrid_azure::{AzureResult, InstanceMetadata};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ScalesetError, ScalesetResult};

/// Which image to inject into a template. All fields optional; empty
/// means "inherit from the template as-is".
#[derive(Debug, Clone, Default)]
pub struct ImageSpec {
    pub sig_image_name: Option<String>,
    pub sig_image_version: Option<String>,
    pub image_name: Option<String>,
}

impl ImageSpec {
    pub fn is_empty(&self) -> bool {
        self.sig_image_name.is_none() && self.sig_image_version.is_none() && self.image_name.is_none()
    }
}

/// Fill an empty spec from the instance metadata service.
///
/// A gallery-backed id (`…/galleries/…`) yields the shared-image name
/// and version; anything else yields the plain image name.
pub async fn resolve_image(
    spec: ImageSpec,
    metadata: &InstanceMetadata,
) -> AzureResult<ImageSpec> {
    if !spec.is_empty() {
        return Ok(spec);
    }
    let image_ref = metadata.image_reference().await?;
    let id = image_ref["id"].as_str().unwrap_or_default();
    let segments: Vec<&str> = id.split('/').collect();

    let segment_after = |marker: &str| -> Option<String> {
        segments
            .iter()
            .position(|s| *s == marker)
            .and_then(|i| segments.get(i + 1))
            .map(|s| s.to_string())
    };

    let resolved = if segments.contains(&"galleries") {
        ImageSpec {
            sig_image_name: segment_after("images"),
            sig_image_version: segment_after("versions"),
            image_name: None,
        }
    } else {
        ImageSpec {
            image_name: segment_after("images"),
            ..Default::default()
        }
    };
    debug!(?resolved, "image resolved from instance metadata");
    Ok(resolved)
}

/// Patch the template's `imageReference.id` in place.
///
/// Handles both the scale-set shape
/// (`properties.virtualMachineProfile.storageProfile.imageReference`)
/// and the standalone VM shape (`properties.storageProfile.imageReference`).
pub fn patch_image_reference(template: &mut Value, spec: &ImageSpec) -> ScalesetResult<()> {
    if spec.is_empty() {
        return Ok(());
    }

    let image_ref = locate_image_reference(template)?;
    let id = image_ref["id"]
        .as_str()
        .ok_or_else(|| ScalesetError::Template("imageReference has no id".into()))?;

    let new_id = if let Some(name) = &spec.image_name {
        // Plain image: drop the last four path segments, point at
        // /images/<name> directly.
        let mut segments: Vec<&str> = id.split('/').collect();
        segments.truncate(segments.len().saturating_sub(4));
        format!("{}/images/{}", segments.join("/"), name)
    } else {
        let sig = spec
            .sig_image_name
            .as_ref()
            .expect("non-empty spec without image_name carries a sig name");
        let mut segments: Vec<&str> = id.split('/').collect();
        segments.pop();
        let mut new_id = format!("{}/{}", segments.join("/"), sig);
        if let Some(version) = &spec.sig_image_version {
            new_id = format!("{new_id}/versions/{version}");
        }
        new_id
    };

    image_ref["id"] = json!(new_id);
    Ok(())
}

fn locate_image_reference(template: &mut Value) -> ScalesetResult<&mut Value> {
    let profile = &mut template["properties"];
    let storage = if profile["virtualMachineProfile"].is_object() {
        &mut profile["virtualMachineProfile"]["storageProfile"]
    } else {
        &mut profile["storageProfile"]
    };
    if !storage["imageReference"].is_object() {
        return Err(ScalesetError::Template(
            "template has no storageProfile.imageReference".into(),
        ));
    }
    Ok(&mut storage["imageReference"])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaleset_template(id: &str) -> Value {
        json!({
            "properties": {
                "virtualMachineProfile": {
                    "storageProfile": {"imageReference": {"id": id}}
                }
            }
        })
    }

    fn vm_template(id: &str) -> Value {
        json!({
            "properties": {
                "storageProfile": {"imageReference": {"id": id}}
            }
        })
    }

    const GALLERY_ID: &str = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/base/versions/1.0.0";

    #[test]
    fn sig_name_replaces_last_segment() {
        let mut t = scaleset_template("/subscriptions/s/galleries/gal/images/base");
        let spec = ImageSpec {
            sig_image_name: Some("custom".into()),
            ..Default::default()
        };
        patch_image_reference(&mut t, &spec).unwrap();
        assert_eq!(
            t["properties"]["virtualMachineProfile"]["storageProfile"]["imageReference"]["id"],
            "/subscriptions/s/galleries/gal/images/custom"
        );
    }

    #[test]
    fn sig_version_appends_versions_path() {
        let mut t = scaleset_template("/subscriptions/s/galleries/gal/images/base");
        let spec = ImageSpec {
            sig_image_name: Some("custom".into()),
            sig_image_version: Some("2.1.0".into()),
            ..Default::default()
        };
        patch_image_reference(&mut t, &spec).unwrap();
        assert_eq!(
            t["properties"]["virtualMachineProfile"]["storageProfile"]["imageReference"]["id"],
            "/subscriptions/s/galleries/gal/images/custom/versions/2.1.0"
        );
    }

    #[test]
    fn image_name_takes_precedence_and_drops_four_segments() {
        let mut t = vm_template(GALLERY_ID);
        let spec = ImageSpec {
            sig_image_name: Some("ignored".into()),
            image_name: Some("plain".into()),
            ..Default::default()
        };
        patch_image_reference(&mut t, &spec).unwrap();
        assert_eq!(
            t["properties"]["storageProfile"]["imageReference"]["id"],
            "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/galleries/gal/images/plain"
        );
    }

    #[test]
    fn empty_spec_leaves_template_untouched() {
        let mut t = scaleset_template(GALLERY_ID);
        patch_image_reference(&mut t, &ImageSpec::default()).unwrap();
        assert_eq!(
            t["properties"]["virtualMachineProfile"]["storageProfile"]["imageReference"]["id"],
            GALLERY_ID
        );
    }

    #[test]
    fn template_without_image_reference_errors() {
        let mut t = json!({"properties": {}});
        let spec = ImageSpec {
            image_name: Some("x".into()),
            ..Default::default()
        };
        assert!(patch_image_reference(&mut t, &spec).is_err());
    }
}
