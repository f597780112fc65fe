//! The bundle data model
//!
//! A bundle is one immutable, versioned artifact of a package: a content
//! reference plus the upgrade edges (`replaces`, `skips`, `skipRange`) that
//! declare which prior versions it may legally upgrade from.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use trellis_common::crd::BundleMetadata;

/// Property type carrying a bundle's own (packageName, version) declaration
pub const PROPERTY_PACKAGE: &str = "olm.package";

/// Dependency property types this system does not support. Bundles declaring
/// any of these are inadmissible: explicit dependency declarations are
/// rejected, not resolved.
pub const UNSUPPORTED_DEPENDENCY_PROPERTIES: [&str; 3] =
    ["olm.package.required", "olm.gvk.required", "olm.constraint"];

/// A typed property declaration on a bundle
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Property {
    /// Property type, e.g. "olm.package"
    #[serde(rename = "type")]
    pub type_: String,
    /// Property payload; opaque except for known types
    #[serde(default)]
    pub value: serde_json::Value,
}

/// One version of a package's installable content plus its upgrade edges
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    /// Bundle name, e.g. "prometheus-operator.1.2.0"
    pub name: String,
    /// Package this bundle belongs to
    pub package: String,
    /// Semantic version of the bundle
    pub version: Version,
    /// Content reference (image digest or archive locator)
    pub image: String,
    /// The single version this bundle supersedes
    pub replaces: Option<String>,
    /// Versions this bundle may upgrade from, bypassing them
    pub skips: Vec<String>,
    /// Version interval this bundle may upgrade from
    pub skip_range: Option<VersionReq>,
    /// Channels this bundle is published on
    pub channels: Vec<String>,
    /// Property declarations carried by the bundle
    pub properties: Vec<Property>,
    /// Whether the catalog marks this bundle deprecated
    pub deprecated: bool,
}

impl Bundle {
    /// The (name, version) projection persisted in Extension status
    pub fn metadata(&self) -> BundleMetadata {
        BundleMetadata {
            name: self.name.clone(),
            version: self.version.to_string(),
        }
    }

    /// The first unsupported dependency property this bundle declares, if any
    pub fn unsupported_dependency(&self) -> Option<&str> {
        self.properties
            .iter()
            .map(|p| p.type_.as_str())
            .find(|t| UNSUPPORTED_DEPENDENCY_PROPERTIES.contains(t))
    }

    /// Whether this bundle is published on the given channel
    pub fn on_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

/// Parse a skipRange expression into a semver requirement.
///
/// Catalogs write ranges with space-separated comparators
/// (`>=1.0.0 <1.2.0`); `VersionReq` wants commas, so comparators are
/// rejoined before parsing.
pub fn parse_skip_range(raw: &str) -> Result<VersionReq, semver::Error> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(", ");
    VersionReq::parse(&normalized)
}
