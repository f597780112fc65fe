//! Catalog CRD: a source of bundles for one or more packages
//!
//! The catalog-serving subsystem (ingesting the index image and exposing its
//! content over HTTP) is an external collaborator. The CRD exists so the
//! operator can discover content endpoints and re-trigger extension
//! resolution whenever catalog content changes.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Catalog points at a content-addressed index image of available bundles.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "Catalog",
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.source.image"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSpec {
    /// Where the catalog index content comes from
    pub source: CatalogSource,

    /// How often the source is re-checked for new content, in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_minutes: Option<u32>,
}

/// Source of catalog index content
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSource {
    /// Reference to the index image containing the catalog content
    pub image: String,
}

/// Catalog status, written by the catalog-serving subsystem
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStatus {
    /// Current phase
    #[serde(default)]
    pub phase: CatalogPhase,

    /// URL the ingested catalog content is served at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,

    /// When the source image was last successfully ingested.
    /// Changes here signal new content and re-trigger dependent extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unpacked: Option<DateTime<Utc>>,

    /// Human-readable message for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Catalog lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CatalogPhase {
    /// Content has not been ingested yet
    #[default]
    Pending,
    /// Content is ingested and served
    Serving,
    /// Content ingestion failed
    Failed,
}

impl std::fmt::Display for CatalogPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Serving => write!(f, "Serving"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl Catalog {
    /// Whether this catalog currently serves queryable content
    pub fn is_serving(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == CatalogPhase::Serving && s.content_url.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_yaml_roundtrip() {
        let yaml = r#"
apiVersion: trellis.dev/v1alpha1
kind: Catalog
metadata:
  name: operatorhub
spec:
  source:
    image: quay.io/operatorhub/index@sha256:7e2f
  pollIntervalMinutes: 15
"#;
        let catalog: Catalog = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(catalog.spec.source.image, "quay.io/operatorhub/index@sha256:7e2f");
        assert_eq!(catalog.spec.poll_interval_minutes, Some(15));
        assert!(!catalog.is_serving());
    }

    #[test]
    fn serving_requires_phase_and_content_url() {
        let yaml = r#"
apiVersion: trellis.dev/v1alpha1
kind: Catalog
metadata:
  name: operatorhub
spec:
  source:
    image: quay.io/operatorhub/index:latest
status:
  phase: Serving
  contentUrl: http://catalogd.trellis-system.svc/catalogs/operatorhub/all.json
"#;
        let catalog: Catalog = serde_yaml::from_str(yaml).expect("parse");
        assert!(catalog.is_serving());

        let yaml_pending = r#"
apiVersion: trellis.dev/v1alpha1
kind: Catalog
metadata:
  name: operatorhub
spec:
  source:
    image: quay.io/operatorhub/index:latest
status:
  phase: Pending
"#;
        let catalog: Catalog = serde_yaml::from_str(yaml_pending).expect("parse");
        assert!(!catalog.is_serving());
    }
}
