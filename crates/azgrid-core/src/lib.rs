//! azgrid-core — shared foundation for the AzGrid cluster manager.
//!
//! Holds the pieces every other crate leans on: the user manifest
//! (account/subscription defaults), the on-disk template catalogs, and
//! the data types that cross crate boundaries (scale-set identity,
//! worker metadata, the detached-VM identity).

pub mod error;
pub mod manifest;
pub mod templates;
pub mod types;

pub use error::{CoreError, CoreResult};
pub use manifest::Manifest;
pub use templates::{Template, TemplateCatalog};
pub use types::*;
