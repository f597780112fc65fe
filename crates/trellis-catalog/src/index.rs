//! Catalog index: declarative content parsing and the query interface
//!
//! Catalog content is a stream of JSON documents distinguished by a `schema`
//! field (`olm.package`, `olm.channel`, `olm.bundle`, `olm.deprecations`).
//! Channel entries carry the upgrade edges; parsing merges them onto the
//! bundles they name so the resolver sees edges as bundle attributes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, warn};

use trellis_common::crd::Catalog;
use trellis_common::{Error, Result};

use crate::bundle::{parse_skip_range, Bundle, Property, PROPERTY_PACKAGE};

/// Read-only query interface over the cluster's ingested catalog content.
///
/// Implementations must reflect the latest successfully ingested content;
/// staleness is acceptable only until the catalog itself reports a
/// content-updated event.
#[async_trait]
pub trait CatalogIndex: Send + Sync {
    /// List every known bundle of the given package, across all catalogs.
    async fn list_bundles(&self, package: &str) -> Result<Vec<Bundle>>;
}

// =============================================================================
// Declarative catalog parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChannelDoc {
    name: String,
    package: String,
    #[serde(default)]
    entries: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    name: String,
    #[serde(default)]
    replaces: Option<String>,
    #[serde(default)]
    skips: Vec<String>,
    #[serde(default, rename = "skipRange")]
    skip_range: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BundleDoc {
    name: String,
    package: String,
    image: String,
    #[serde(default)]
    properties: Vec<Property>,
}

#[derive(Debug, Deserialize)]
struct DeprecationsDoc {
    #[serde(default)]
    entries: Vec<DeprecationEntry>,
}

#[derive(Debug, Deserialize)]
struct DeprecationEntry {
    reference: DeprecationReference,
}

#[derive(Debug, Deserialize)]
struct DeprecationReference {
    schema: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PackageProperty {
    #[serde(default)]
    version: Option<String>,
}

/// Parse a catalog content document into bundles.
///
/// Accepts either a JSON array of documents or a concatenated/newline
/// delimited stream. Unknown schemas are skipped; a bundle without a
/// parseable version property is dropped with a warning rather than failing
/// the whole catalog.
pub fn parse_catalog_content(content: &str) -> Result<Vec<Bundle>> {
    let mut docs: Vec<serde_json::Value> = Vec::new();
    for value in serde_json::Deserializer::from_str(content).into_iter::<serde_json::Value>() {
        let value = value
            .map_err(|e| Error::serialization(format!("invalid catalog content: {e}")))?;
        match value {
            serde_json::Value::Array(items) => docs.extend(items),
            other => docs.push(other),
        }
    }

    let mut bundles: Vec<Bundle> = Vec::new();
    let mut channels: Vec<ChannelDoc> = Vec::new();
    let mut deprecated_bundles: Vec<String> = Vec::new();

    for doc in docs {
        let schema = doc.get("schema").and_then(|s| s.as_str()).unwrap_or("");
        match schema {
            "olm.bundle" => {
                let parsed: BundleDoc = serde_json::from_value(doc).map_err(|e| {
                    Error::serialization_for_kind("olm.bundle", e.to_string())
                })?;
                match bundle_from_doc(parsed) {
                    Some(bundle) => bundles.push(bundle),
                    None => continue,
                }
            }
            "olm.channel" => {
                let parsed: ChannelDoc = serde_json::from_value(doc).map_err(|e| {
                    Error::serialization_for_kind("olm.channel", e.to_string())
                })?;
                channels.push(parsed);
            }
            "olm.deprecations" => {
                let parsed: DeprecationsDoc = serde_json::from_value(doc).map_err(|e| {
                    Error::serialization_for_kind("olm.deprecations", e.to_string())
                })?;
                deprecated_bundles.extend(parsed.entries.into_iter().filter_map(|e| {
                    (e.reference.schema == "olm.bundle")
                        .then_some(e.reference.name)
                        .flatten()
                }));
            }
            // olm.package only names the default channel, which resolution
            // does not consult
            "olm.package" => {}
            other => {
                debug!(schema = %other, "skipping unknown catalog schema");
            }
        }
    }

    for channel in &channels {
        for entry in &channel.entries {
            let Some(bundle) = bundles
                .iter_mut()
                .find(|b| b.name == entry.name && b.package == channel.package)
            else {
                warn!(
                    channel = %channel.name,
                    entry = %entry.name,
                    "channel entry references a bundle not present in the catalog"
                );
                continue;
            };
            bundle.channels.push(channel.name.clone());
            if bundle.replaces.is_none() {
                bundle.replaces = entry.replaces.clone();
            }
            for skip in &entry.skips {
                if !bundle.skips.contains(skip) {
                    bundle.skips.push(skip.clone());
                }
            }
            if bundle.skip_range.is_none() {
                if let Some(raw) = &entry.skip_range {
                    match parse_skip_range(raw) {
                        Ok(req) => bundle.skip_range = Some(req),
                        Err(e) => warn!(
                            bundle = %bundle.name,
                            skip_range = %raw,
                            error = %e,
                            "ignoring unparseable skipRange"
                        ),
                    }
                }
            }
        }
    }

    for bundle in &mut bundles {
        if deprecated_bundles.iter().any(|name| *name == bundle.name) {
            bundle.deprecated = true;
        }
    }

    Ok(bundles)
}

fn bundle_from_doc(doc: BundleDoc) -> Option<Bundle> {
    let version = doc
        .properties
        .iter()
        .find(|p| p.type_ == PROPERTY_PACKAGE)
        .and_then(|p| serde_json::from_value::<PackageProperty>(p.value.clone()).ok())
        .and_then(|p| p.version)
        .and_then(|v| match semver::Version::parse(&v) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(bundle = %doc.name, version = %v, error = %e, "skipping bundle with invalid version");
                None
            }
        });

    let Some(version) = version else {
        warn!(bundle = %doc.name, "skipping bundle without a version property");
        return None;
    };

    Some(Bundle {
        name: doc.name,
        package: doc.package,
        version,
        image: doc.image,
        replaces: None,
        skips: Vec::new(),
        skip_range: None,
        channels: Vec::new(),
        properties: doc.properties,
        deprecated: false,
    })
}

// =============================================================================
// HTTP index client
// =============================================================================

struct CachedContents {
    /// content_url + last_unpacked; a change in either invalidates the entry
    key: String,
    bundles: Arc<Vec<Bundle>>,
}

/// Index client backed by the cluster's Catalog objects.
///
/// Lists serving catalogs, fetches each catalog's content endpoint, and
/// caches parsed contents per catalog until the catalog reports new content
/// (content URL or last-unpacked timestamp change).
pub struct HttpCatalogIndex {
    client: Client,
    http: reqwest::Client,
    cache: DashMap<String, CachedContents>,
}

impl HttpCatalogIndex {
    /// Per-request timeout for catalog content fetches
    const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create an index client over the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
            cache: DashMap::new(),
        }
    }

    async fn fetch_contents(&self, catalog_name: &str, url: &str) -> Result<Vec<Bundle>> {
        let response = self
            .http
            .get(url)
            .timeout(Self::FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::catalog_for(catalog_name, format!("content fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::catalog_for(
                catalog_name,
                format!("content endpoint returned {}", response.status()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::catalog_for(catalog_name, format!("content read failed: {e}")))?;
        parse_catalog_content(&body)
            .map_err(|e| Error::catalog_for(catalog_name, e.to_string()))
    }
}

#[async_trait]
impl CatalogIndex for HttpCatalogIndex {
    async fn list_bundles(&self, package: &str) -> Result<Vec<Bundle>> {
        let catalogs: Api<Catalog> = Api::all(self.client.clone());
        let list = catalogs
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::catalog(format!("failed to list catalogs: {e}")))?;

        let mut out = Vec::new();
        for catalog in list {
            let name = catalog.name_any();
            let serving = catalog
                .is_serving()
                .then(|| catalog.status.as_ref())
                .flatten()
                .and_then(|s| s.content_url.clone().map(|url| (url, s.last_unpacked)));
            let Some((url, last_unpacked)) = serving else {
                debug!(catalog = %name, "catalog not serving yet, skipping");
                continue;
            };
            let key = format!(
                "{url}|{}",
                last_unpacked.map(|t| t.to_rfc3339()).unwrap_or_default()
            );

            let cached = self
                .cache
                .get(&name)
                .filter(|entry| entry.key == key)
                .map(|entry| entry.bundles.clone());

            let bundles = match cached {
                Some(bundles) => bundles,
                None => {
                    debug!(catalog = %name, url = %url, "fetching catalog content");
                    let bundles = Arc::new(self.fetch_contents(&name, &url).await?);
                    self.cache.insert(
                        name.clone(),
                        CachedContents {
                            key,
                            bundles: bundles.clone(),
                        },
                    );
                    bundles
                }
            };

            out.extend(bundles.iter().filter(|b| b.package == package).cloned());
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_JSON: &str = r#"
{"schema": "olm.package", "name": "prometheus", "defaultChannel": "stable"}
{"schema": "olm.channel", "name": "stable", "package": "prometheus", "entries": [
    {"name": "prometheus-operator.1.0.0"},
    {"name": "prometheus-operator.1.0.1", "replaces": "prometheus-operator.1.0.0"},
    {"name": "prometheus-operator.1.2.0", "skipRange": ">=1.1.0 <1.2.0"}
]}
{"schema": "olm.bundle", "name": "prometheus-operator.1.0.0", "package": "prometheus",
 "image": "quay.io/prometheus/operator@sha256:0100",
 "properties": [{"type": "olm.package", "value": {"packageName": "prometheus", "version": "1.0.0"}}]}
{"schema": "olm.bundle", "name": "prometheus-operator.1.0.1", "package": "prometheus",
 "image": "quay.io/prometheus/operator@sha256:0101",
 "properties": [{"type": "olm.package", "value": {"packageName": "prometheus", "version": "1.0.1"}}]}
{"schema": "olm.bundle", "name": "prometheus-operator.1.2.0", "package": "prometheus",
 "image": "quay.io/prometheus/operator@sha256:0120",
 "properties": [{"type": "olm.package", "value": {"packageName": "prometheus", "version": "1.2.0"}}]}
{"schema": "olm.deprecations", "package": "prometheus", "entries": [
    {"reference": {"schema": "olm.bundle", "name": "prometheus-operator.1.0.0"},
     "message": "1.0.0 is no longer maintained"}
]}
"#;

    #[test]
    fn parses_bundles_with_channel_edges() {
        let bundles = parse_catalog_content(CATALOG_JSON).expect("parse");
        assert_eq!(bundles.len(), 3);

        let b101 = bundles
            .iter()
            .find(|b| b.name == "prometheus-operator.1.0.1")
            .unwrap();
        assert_eq!(
            b101.replaces.as_deref(),
            Some("prometheus-operator.1.0.0")
        );
        assert_eq!(b101.channels, vec!["stable".to_string()]);
        assert_eq!(b101.version, semver::Version::new(1, 0, 1));

        let b120 = bundles
            .iter()
            .find(|b| b.name == "prometheus-operator.1.2.0")
            .unwrap();
        let range = b120.skip_range.as_ref().expect("skipRange parsed");
        assert!(range.matches(&semver::Version::new(1, 1, 0)));
        assert!(!range.matches(&semver::Version::new(1, 0, 0)));
    }

    #[test]
    fn deprecation_entries_mark_bundles() {
        let bundles = parse_catalog_content(CATALOG_JSON).expect("parse");
        let b100 = bundles
            .iter()
            .find(|b| b.name == "prometheus-operator.1.0.0")
            .unwrap();
        assert!(b100.deprecated);
        let b101 = bundles
            .iter()
            .find(|b| b.name == "prometheus-operator.1.0.1")
            .unwrap();
        assert!(!b101.deprecated);
    }

    #[test]
    fn accepts_json_array_form() {
        let content = r#"[
            {"schema": "olm.bundle", "name": "x.1.0.0", "package": "x",
             "image": "quay.io/x@sha256:aa",
             "properties": [{"type": "olm.package", "value": {"packageName": "x", "version": "1.0.0"}}]}
        ]"#;
        let bundles = parse_catalog_content(content).expect("parse");
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].package, "x");
    }

    #[test]
    fn skips_bundles_without_version_property() {
        let content = r#"
{"schema": "olm.bundle", "name": "broken.1.0.0", "package": "broken",
 "image": "quay.io/broken@sha256:aa", "properties": []}
{"schema": "olm.bundle", "name": "ok.1.0.0", "package": "ok",
 "image": "quay.io/ok@sha256:bb",
 "properties": [{"type": "olm.package", "value": {"packageName": "ok", "version": "1.0.0"}}]}
"#;
        let bundles = parse_catalog_content(content).expect("parse");
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].name, "ok.1.0.0");
    }

    #[test]
    fn skips_unknown_schemas() {
        let content = r#"
{"schema": "olm.future-schema", "whatever": true}
{"schema": "olm.bundle", "name": "ok.1.0.0", "package": "ok",
 "image": "quay.io/ok@sha256:bb",
 "properties": [{"type": "olm.package", "value": {"packageName": "ok", "version": "1.0.0"}}]}
"#;
        let bundles = parse_catalog_content(content).expect("parse");
        assert_eq!(bundles.len(), 1);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_catalog_content("{not json").is_err());
    }

    #[test]
    fn preserves_dependency_properties() {
        let content = r#"
{"schema": "olm.bundle", "name": "dep.1.0.0", "package": "dep",
 "image": "quay.io/dep@sha256:cc",
 "properties": [
    {"type": "olm.package", "value": {"packageName": "dep", "version": "1.0.0"}},
    {"type": "olm.package.required", "value": "content-is-not-relevant"}
 ]}
"#;
        let bundles = parse_catalog_content(content).expect("parse");
        assert_eq!(
            bundles[0].unsupported_dependency(),
            Some("olm.package.required")
        );
    }
}
