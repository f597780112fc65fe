//! Extension CRD: a user's declaration of a desired catalog package
//!
//! An Extension names a package and optional version/channel constraints; the
//! controller resolves it against the cluster's catalogs, unpacks the chosen
//! bundle, installs its content into `installNamespace` under the given
//! service account, and reports progress through the fixed condition set.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/// Extension declares the desired state of one installed package.
///
/// Example:
/// ```yaml
/// apiVersion: trellis.dev/v1alpha1
/// kind: Extension
/// metadata:
///   name: prometheus
/// spec:
///   packageName: prometheus
///   version: 1.2.0
///   installNamespace: monitoring
///   serviceAccount:
///     name: prometheus-installer
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "Extension",
    status = "ExtensionStatus",
    printcolumn = r#"{"name":"Package","type":"string","jsonPath":".spec.packageName"}"#,
    printcolumn = r#"{"name":"Resolved","type":"string","jsonPath":".status.resolvedBundle.version"}"#,
    printcolumn = r#"{"name":"Installed","type":"string","jsonPath":".status.installedBundle.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Name of the package to install, unique within a catalog
    pub package_name: String,

    /// Exact version to install. When unset, the highest admissible version
    /// is selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Channel to restrict candidate bundles to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Whether upgrades must follow the package's declared upgrade edges
    #[serde(default)]
    pub upgrade_constraint_policy: UpgradeConstraintPolicy,

    /// Namespace the bundle content is installed into. Expected to exist.
    pub install_namespace: String,

    /// Service account used to apply the bundle content
    pub service_account: ServiceAccountReference,
}

/// Upgrade-constraint policy for version changes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradeConstraintPolicy {
    /// Only versions reachable from the installed version via the upgrade
    /// graph (replaces/skips/skipRange) are admissible
    #[default]
    Enforce,
    /// Any version satisfying the explicit constraints is admissible
    Ignore,
}

/// Reference to the service account used for installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountReference {
    /// Name of the service account in the install namespace
    pub name: String,
}

/// A lightweight (name, version) reference to a bundle, used in status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    /// Bundle name, e.g. "prometheus-operator.1.2.0"
    pub name: String,
    /// Bundle version, e.g. "1.2.0"
    pub version: String,
}

/// Extension status, written only by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    /// The fixed, ordered condition set (Resolved, Unpacked, Installed)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The bundle the last successful resolution selected.
    /// Non-empty exactly when the Resolved condition is True.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_bundle: Option<BundleMetadata>,

    /// The bundle most recently applied to the cluster. Only ever set to a
    /// bundle that passed both resolution and successful installation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_bundle: Option<BundleMetadata>,
}

impl ExtensionSpec {
    /// Validate the spec before reconciling it.
    ///
    /// Catches misconfigurations that no amount of retrying can fix: empty or
    /// non-DNS package names, an unparseable exact version, missing install
    /// identity.
    pub fn validate(&self) -> Result<(), String> {
        if self.package_name.is_empty() {
            return Err("packageName must not be empty".to_string());
        }
        if !self
            .package_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        {
            return Err(format!(
                "packageName {:?} must consist of lowercase alphanumeric characters, '-' or '.'",
                self.package_name
            ));
        }
        if let Some(version) = &self.version {
            semver::Version::parse(version)
                .map_err(|e| format!("version {version:?} is not a valid semantic version: {e}"))?;
        }
        if self.install_namespace.is_empty() {
            return Err("installNamespace must not be empty".to_string());
        }
        if self.service_account.name.is_empty() {
            return Err("serviceAccount.name must not be empty".to_string());
        }
        Ok(())
    }
}
