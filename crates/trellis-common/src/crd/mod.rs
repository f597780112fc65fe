//! Custom Resource Definitions for Trellis

mod catalog;
mod extension;

pub use catalog::{Catalog, CatalogPhase, CatalogSource, CatalogSpec, CatalogStatus};
pub use extension::{
    BundleMetadata, Extension, ExtensionSpec, ExtensionStatus, ServiceAccountReference,
    UpgradeConstraintPolicy,
};
