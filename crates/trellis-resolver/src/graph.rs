//! Upgrade-edge graph over a package's versions
//!
//! The graph is rebuilt from catalog contents on every resolution call so it
//! can never drift from what the catalog currently serves. Edges point from a
//! version to the versions that may legally be upgraded to from it.

use std::collections::{BTreeSet, HashMap};

use semver::Version;

use trellis_catalog::Bundle;

/// Directed graph of legal upgrades, adjacency keyed by source version.
///
/// An edge `v -> w` exists when the bundle at `w` declares it may upgrade
/// from `v`: `replaces` names `v`'s bundle, `v` is in `skips`, or `v` falls
/// inside `skipRange`. Every version also carries a self-edge so a converged
/// installation keeps resolving to itself.
#[derive(Debug, Default)]
pub struct SuccessorGraph {
    successors: HashMap<Version, BTreeSet<Version>>,
}

impl SuccessorGraph {
    /// Build the graph from one package's bundles.
    ///
    /// `replaces` and `skips` entries name bundles; they are mapped to
    /// versions through the supplied bundle set. An entry that parses as a
    /// bare version is accepted as one, so catalogs that declare edges by
    /// version instead of bundle name still work.
    pub fn from_bundles<'a, I>(bundles: I) -> Self
    where
        I: IntoIterator<Item = &'a Bundle> + Clone,
    {
        let version_by_name: HashMap<&str, &Version> = bundles
            .clone()
            .into_iter()
            .map(|b| (b.name.as_str(), &b.version))
            .collect();
        let all_versions: Vec<Version> = bundles
            .clone()
            .into_iter()
            .map(|b| b.version.clone())
            .collect();

        let mut successors: HashMap<Version, BTreeSet<Version>> = HashMap::new();
        for version in &all_versions {
            successors
                .entry(version.clone())
                .or_default()
                .insert(version.clone());
        }

        let resolve_edge = |name: &str| -> Option<Version> {
            version_by_name
                .get(name)
                .map(|v| (*v).clone())
                .or_else(|| Version::parse(name).ok())
        };

        for bundle in bundles {
            if let Some(replaced) = bundle.replaces.as_deref().and_then(resolve_edge) {
                successors
                    .entry(replaced)
                    .or_default()
                    .insert(bundle.version.clone());
            }
            for skip in &bundle.skips {
                if let Some(skipped) = resolve_edge(skip) {
                    successors
                        .entry(skipped)
                        .or_default()
                        .insert(bundle.version.clone());
                }
            }
            if let Some(range) = &bundle.skip_range {
                for version in &all_versions {
                    if range.matches(version) {
                        successors
                            .entry(version.clone())
                            .or_default()
                            .insert(bundle.version.clone());
                    }
                }
            }
        }

        Self { successors }
    }

    /// Whether `to` is a legal upgrade target from `from`
    pub fn is_successor(&self, from: &Version, to: &Version) -> bool {
        self.successors
            .get(from)
            .map(|targets| targets.contains(to))
            .unwrap_or(false)
    }

    /// The legal upgrade targets from the given version, ascending
    pub fn successors_of(&self, from: &Version) -> impl Iterator<Item = &Version> {
        self.successors.get(from).into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_catalog::parse_skip_range;

    fn bundle(name: &str, version: &str) -> Bundle {
        Bundle {
            name: name.to_string(),
            package: "prometheus".to_string(),
            version: Version::parse(version).unwrap(),
            image: format!("quay.io/prometheus/{name}"),
            replaces: None,
            skips: Vec::new(),
            skip_range: None,
            channels: vec!["stable".to_string()],
            properties: Vec::new(),
            deprecated: false,
        }
    }

    #[test]
    fn replaces_by_bundle_name_creates_edge() {
        let b100 = bundle("prometheus-operator.1.0.0", "1.0.0");
        let mut b101 = bundle("prometheus-operator.1.0.1", "1.0.1");
        b101.replaces = Some("prometheus-operator.1.0.0".to_string());
        let bundles = vec![b100, b101];

        let graph = SuccessorGraph::from_bundles(&bundles);
        assert!(graph.is_successor(
            &Version::new(1, 0, 0),
            &Version::new(1, 0, 1)
        ));
        assert!(!graph.is_successor(
            &Version::new(1, 0, 1),
            &Version::new(1, 0, 0)
        ));
    }

    #[test]
    fn replaces_by_bare_version_creates_edge() {
        let b100 = bundle("prometheus-operator.1.0.0", "1.0.0");
        let mut b110 = bundle("prometheus-operator.1.1.0", "1.1.0");
        b110.replaces = Some("1.0.0".to_string());
        let bundles = vec![b100, b110];

        let graph = SuccessorGraph::from_bundles(&bundles);
        assert!(graph.is_successor(&Version::new(1, 0, 0), &Version::new(1, 1, 0)));
    }

    #[test]
    fn skips_create_edges_from_each_skipped_version() {
        let b100 = bundle("prometheus-operator.1.0.0", "1.0.0");
        let b101 = bundle("prometheus-operator.1.0.1", "1.0.1");
        let mut b120 = bundle("prometheus-operator.1.2.0", "1.2.0");
        b120.skips = vec![
            "prometheus-operator.1.0.0".to_string(),
            "prometheus-operator.1.0.1".to_string(),
        ];
        let bundles = vec![b100, b101, b120];

        let graph = SuccessorGraph::from_bundles(&bundles);
        assert!(graph.is_successor(&Version::new(1, 0, 0), &Version::new(1, 2, 0)));
        assert!(graph.is_successor(&Version::new(1, 0, 1), &Version::new(1, 2, 0)));
    }

    #[test]
    fn skip_range_covers_interval() {
        let b100 = bundle("prometheus-operator.1.0.0", "1.0.0");
        let b110 = bundle("prometheus-operator.1.1.0", "1.1.0");
        let mut b200 = bundle("prometheus-operator.2.0.0", "2.0.0");
        b200.skip_range = Some(parse_skip_range(">=1.0.0 <2.0.0").unwrap());
        let bundles = vec![b100, b110, b200];

        let graph = SuccessorGraph::from_bundles(&bundles);
        assert!(graph.is_successor(&Version::new(1, 0, 0), &Version::new(2, 0, 0)));
        assert!(graph.is_successor(&Version::new(1, 1, 0), &Version::new(2, 0, 0)));
        assert!(!graph.is_successor(&Version::new(2, 0, 0), &Version::new(1, 0, 0)));
    }

    #[test]
    fn every_version_is_its_own_successor() {
        let bundles = vec![
            bundle("prometheus-operator.1.0.0", "1.0.0"),
            bundle("prometheus-operator.1.2.0", "1.2.0"),
        ];
        let graph = SuccessorGraph::from_bundles(&bundles);
        assert!(graph.is_successor(&Version::new(1, 0, 0), &Version::new(1, 0, 0)));
        assert!(graph.is_successor(&Version::new(1, 2, 0), &Version::new(1, 2, 0)));
    }

    #[test]
    fn unrelated_versions_are_not_successors() {
        let bundles = vec![
            bundle("prometheus-operator.1.0.0", "1.0.0"),
            bundle("prometheus-operator.1.2.0", "1.2.0"),
        ];
        let graph = SuccessorGraph::from_bundles(&bundles);
        assert!(!graph.is_successor(&Version::new(1, 0, 0), &Version::new(1, 2, 0)));
    }

    #[test]
    fn successors_iterate_in_ascending_order() {
        let b100 = bundle("prometheus-operator.1.0.0", "1.0.0");
        let mut b101 = bundle("prometheus-operator.1.0.1", "1.0.1");
        b101.replaces = Some("prometheus-operator.1.0.0".to_string());
        let mut b110 = bundle("prometheus-operator.1.1.0", "1.1.0");
        b110.skips = vec!["prometheus-operator.1.0.0".to_string()];
        let bundles = vec![b100, b101, b110];

        let graph = SuccessorGraph::from_bundles(&bundles);
        let successors: Vec<String> = graph
            .successors_of(&Version::new(1, 0, 0))
            .map(|v| v.to_string())
            .collect();
        assert_eq!(successors, vec!["1.0.0", "1.0.1", "1.1.0"]);
    }
}
