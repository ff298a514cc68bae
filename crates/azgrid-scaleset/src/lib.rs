//! azgrid-scaleset — provisioning control loops.
//!
//! Turns a template plus a target capacity into running Azure
//! resources: resolves the boot image, renders the first-boot startup
//! script, reconciles scale sets to their requested size, and manages
//! the standalone VM + NIC pair used by detached jobs.

pub mod cloudinit;
pub mod error;
pub mod image;
pub mod reconciler;
pub mod vm;

pub use cloudinit::{build_detached_script, build_worker_script, detect_project_env, ScriptParams};
pub use error::{ScalesetError, ScalesetResult};
pub use image::{patch_image_reference, resolve_image, ImageSpec};
pub use reconciler::{create_or_update, is_vm_in_scaleset, SshKeys};
