//! Bundle selection
//!
//! `resolve` maps (spec, installed fact, catalog contents) to the bundle that
//! should be installed, or to a typed failure whose message is surfaced on
//! the Resolved condition verbatim.

use semver::Version;
use thiserror::Error;
use tracing::debug;

use trellis_catalog::Bundle;
use trellis_common::crd::{BundleMetadata, ExtensionSpec, UpgradeConstraintPolicy};

use crate::graph::SuccessorGraph;

/// A successful resolution: the selected bundle and whether the catalog
/// marks it deprecated
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The selected bundle
    pub bundle: Bundle,
    /// Whether the selected bundle is deprecated in its catalog
    pub deprecated: bool,
}

/// Typed resolution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No admissible bundle satisfies the current constraints and policy
    #[error("{}", no_match_message(.package, .version.as_deref(), .channel.as_deref(), .installed.as_deref()))]
    NoMatch {
        /// Requested package name
        package: String,
        /// Exact version constraint, if any
        version: Option<String>,
        /// Channel constraint, if any
        channel: Option<String>,
        /// Installed version the upgrade-edge check was applied against;
        /// set only when the check constrained the candidate set
        installed: Option<String>,
    },

    /// A version string in play could not be parsed as semver
    #[error("version {version:?} is not a valid semantic version: {message}")]
    InvalidVersion {
        /// The offending version string
        version: String,
        /// Parser error text
        message: String,
    },
}

fn no_match_message(
    package: &str,
    version: Option<&str>,
    channel: Option<&str>,
    installed: Option<&str>,
) -> String {
    let base = match (version, channel) {
        (Some(v), Some(c)) => {
            format!("no package \"{package}\" matching version \"{v}\" in channel \"{c}\" found")
        }
        (Some(v), None) => format!("no package \"{package}\" matching version \"{v}\" found"),
        (None, Some(c)) => format!("no package \"{package}\" in channel \"{c}\" found"),
        (None, None) => format!("no package \"{package}\" found"),
    };
    match installed {
        Some(iv) => format!("error upgrading from currently installed version \"{iv}\": {base}"),
        None => base,
    }
}

/// Select the bundle satisfying the spec, the installed fact, and the
/// upgrade-constraint policy.
///
/// Pure computation: catalog contents and the installed fact are supplied by
/// the caller, and the upgrade-edge graph is rebuilt from them on every call
/// so resolution can never observe stale graph state.
pub fn resolve(
    spec: &ExtensionSpec,
    installed: Option<&BundleMetadata>,
    bundles: &[Bundle],
) -> Result<Resolution, ResolveError> {
    let requested = spec
        .version
        .as_deref()
        .map(|v| {
            Version::parse(v).map_err(|e| ResolveError::InvalidVersion {
                version: v.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()?;

    let package_bundles: Vec<&Bundle> = bundles
        .iter()
        .filter(|b| b.package == spec.package_name)
        .collect();

    let mut candidates: Vec<&Bundle> = package_bundles
        .iter()
        .copied()
        .filter(|b| requested.as_ref().is_none_or(|v| b.version == *v))
        .filter(|b| spec.channel.as_deref().is_none_or(|c| b.on_channel(c)))
        .collect();

    // The upgrade-edge check applies only when something is installed and the
    // policy enforces edges; Ignore jumps to any constraint-satisfying version.
    let mut upgrading_from = None;
    if let Some(installed) = installed {
        if spec.upgrade_constraint_policy == UpgradeConstraintPolicy::Enforce {
            let installed_version =
                Version::parse(&installed.version).map_err(|e| ResolveError::InvalidVersion {
                    version: installed.version.clone(),
                    message: e.to_string(),
                })?;
            let graph = SuccessorGraph::from_bundles(package_bundles.iter().copied());
            candidates.retain(|b| graph.is_successor(&installed_version, &b.version));
            upgrading_from = Some(installed.version.clone());
        }
    }

    candidates.sort_by(|a, b| a.version.cmp(&b.version));

    // Highest admissible version, preferring non-deprecated bundles
    let best = candidates
        .iter()
        .rev()
        .find(|b| !b.deprecated)
        .or_else(|| candidates.last())
        .copied();

    match best {
        Some(bundle) => {
            debug!(
                package = %spec.package_name,
                bundle = %bundle.name,
                version = %bundle.version,
                deprecated = bundle.deprecated,
                "resolution selected bundle"
            );
            Ok(Resolution {
                bundle: bundle.clone(),
                deprecated: bundle.deprecated,
            })
        }
        None => Err(ResolveError::NoMatch {
            package: spec.package_name.clone(),
            version: spec.version.clone(),
            channel: spec.channel.clone(),
            installed: upgrading_from,
        }),
    }
}
