//! Applying unpacked bundle content to the cluster
//!
//! The installer server-side-applies every manifest of the resolved bundle
//! into the extension's install namespace, impersonating the extension's
//! service account so the user-granted RBAC bounds what a bundle may do.
//! Each installation is recorded in a release ConfigMap; that record is the
//! controller's installed fact and the exact object list teardown walks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use trellis_catalog::Bundle;
use trellis_common::crd::{BundleMetadata, Extension};
use trellis_common::{
    Error, Result, FIELD_MANAGER, LABEL_EXTENSION, LABEL_MANAGED_BY, LABEL_MANAGED_BY_TRELLIS,
};

/// Applies, updates, and removes bundle content for an Extension.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    /// Apply the bundle's manifests to the cluster. The returned error text
    /// is surfaced on the Installed condition verbatim.
    async fn install(&self, ext: &Extension, bundle: &Bundle, manifests: &[String]) -> Result<()>;

    /// Remove everything a previous install applied. Idempotent; succeeds
    /// when nothing is installed.
    async fn uninstall(&self, ext: &Extension) -> Result<()>;

    /// Read the installed fact: the bundle currently applied for this
    /// extension, independent of what resolution currently says.
    async fn get_installed_bundle(&self, ext: &Extension) -> Result<Option<BundleMetadata>>;
}

/// Reference to one applied object, persisted in the release record
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedObjectRef {
    /// apiVersion of the applied object
    pub api_version: String,
    /// Kind of the applied object
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace; None for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Installer that server-side-applies bundle manifests.
pub struct ManifestInstaller {
    client: Client,
    /// Base config used to mint per-extension impersonated clients.
    /// When absent, applies run with the operator's own identity.
    impersonation_base: Option<Config>,
}

impl ManifestInstaller {
    /// Create an installer that applies with the operator's identity
    pub fn new(client: Client) -> Self {
        Self {
            client,
            impersonation_base: None,
        }
    }

    /// Create an installer that impersonates each extension's service account
    pub fn with_impersonation(client: Client, base: Config) -> Self {
        Self {
            client,
            impersonation_base: Some(base),
        }
    }

    fn apply_client(&self, ext: &Extension) -> Result<Client> {
        match &self.impersonation_base {
            Some(base) => {
                let mut config = base.clone();
                config.auth_info.impersonate = Some(impersonation_user(
                    &ext.spec.install_namespace,
                    &ext.spec.service_account.name,
                ));
                Client::try_from(config).map_err(Error::from)
            }
            None => Ok(self.client.clone()),
        }
    }

    async fn read_release(&self, ext: &Extension) -> Result<Option<(BundleMetadata, Vec<AppliedObjectRef>)>> {
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &ext.spec.install_namespace);
        let name = release_name(ext);
        let cm = match api.get(&name).await {
            Ok(cm) => cm,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let data = cm.data.unwrap_or_default();
        let (Some(bundle_name), Some(bundle_version)) =
            (data.get("bundleName"), data.get("bundleVersion"))
        else {
            warn!(release = %name, "release record is missing bundle identity, treating as not installed");
            return Ok(None);
        };
        let objects: Vec<AppliedObjectRef> = data
            .get("objects")
            .map(|raw| {
                serde_json::from_str(raw).map_err(|e| {
                    Error::serialization_for_kind("release record", e.to_string())
                })
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Some((
            BundleMetadata {
                name: bundle_name.clone(),
                version: bundle_version.clone(),
            },
            objects,
        )))
    }

    async fn write_release(
        &self,
        ext: &Extension,
        bundle: &Bundle,
        objects: &[AppliedObjectRef],
    ) -> Result<()> {
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &ext.spec.install_namespace);
        let objects_json = serde_json::to_string(objects)
            .map_err(|e| Error::serialization_for_kind("release record", e.to_string()))?;
        let cm = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": release_name(ext),
                "namespace": ext.spec.install_namespace,
                "labels": {
                    LABEL_MANAGED_BY: LABEL_MANAGED_BY_TRELLIS,
                    LABEL_EXTENSION: ext.metadata.name.as_deref().unwrap_or_default(),
                }
            },
            "data": {
                "bundleName": bundle.name,
                "bundleVersion": bundle.version.to_string(),
                "objects": objects_json,
            }
        });
        api.patch(
            &release_name(ext),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&cm),
        )
        .await?;
        Ok(())
    }

    async fn delete_object(&self, object: &AppliedObjectRef) -> Result<()> {
        let ar = build_api_resource(&object.api_version, &object.kind);
        let api: Api<DynamicObject> = match &object.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        match api.delete(&object.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Installer for ManifestInstaller {
    async fn install(&self, ext: &Extension, bundle: &Bundle, manifests: &[String]) -> Result<()> {
        let apply_client = self.apply_client(ext)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let previous = self.read_release(ext).await?;

        let mut applied: Vec<AppliedObjectRef> = Vec::new();
        for doc in manifests.iter().flat_map(|m| split_documents(m)) {
            let manifest = parse_manifest(doc, ext)?;

            let api: Api<DynamicObject> = match &manifest.namespace {
                Some(ns) => Api::namespaced_with(apply_client.clone(), ns, &manifest.api_resource),
                None => Api::all_with(apply_client.clone(), &manifest.api_resource),
            };
            api.patch(&manifest.name, &params, &Patch::Apply(&manifest.value))
                .await
                .map_err(|e| {
                    Error::installation(format!(
                        "failed to apply {} {:?}: {}",
                        manifest.api_resource.kind, manifest.name, e
                    ))
                })?;
            debug!(
                kind = %manifest.api_resource.kind,
                name = %manifest.name,
                namespace = ?manifest.namespace,
                "applied bundle object"
            );
            applied.push(AppliedObjectRef {
                api_version: manifest.api_resource.api_version.clone(),
                kind: manifest.api_resource.kind.clone(),
                name: manifest.name,
                namespace: manifest.namespace,
            });
        }

        // Objects from the previous bundle that the new one no longer ships
        // are pruned best-effort; a failure here must not fail the install
        if let Some((_, old_objects)) = previous {
            for old in old_objects.iter().filter(|o| !applied.contains(o)) {
                if let Err(e) = self.delete_object(old).await {
                    warn!(
                        kind = %old.kind,
                        name = %old.name,
                        error = %e,
                        "failed to prune object from previous bundle"
                    );
                }
            }
        }

        self.write_release(ext, bundle, &applied).await?;
        info!(
            extension = %ext.metadata.name.as_deref().unwrap_or_default(),
            bundle = %bundle.name,
            objects = applied.len(),
            "bundle installed"
        );
        Ok(())
    }

    async fn uninstall(&self, ext: &Extension) -> Result<()> {
        let Some((bundle, objects)) = self.read_release(ext).await? else {
            debug!(
                extension = %ext.metadata.name.as_deref().unwrap_or_default(),
                "no release record, nothing to tear down"
            );
            return Ok(());
        };

        for object in &objects {
            self.delete_object(object).await?;
        }

        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &ext.spec.install_namespace);
        match api.delete(&release_name(ext), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            extension = %ext.metadata.name.as_deref().unwrap_or_default(),
            bundle = %bundle.name,
            objects = objects.len(),
            "bundle uninstalled"
        );
        Ok(())
    }

    async fn get_installed_bundle(&self, ext: &Extension) -> Result<Option<BundleMetadata>> {
        Ok(self.read_release(ext).await?.map(|(bundle, _)| bundle))
    }
}

// =============================================================================
// Manifest handling
// =============================================================================

#[derive(Debug)]
struct ParsedManifest {
    value: serde_json::Value,
    name: String,
    namespace: Option<String>,
    api_resource: ApiResource,
}

/// Split a multi-document YAML string into its manifest documents
fn split_documents(manifest: &str) -> impl Iterator<Item = &str> {
    manifest
        .split("\n---")
        .map(str::trim)
        .filter(|doc| doc.contains("apiVersion"))
}

fn parse_manifest(doc: &str, ext: &Extension) -> Result<ParsedManifest> {
    let mut value: serde_json::Value = if doc.trim_start().starts_with('{') {
        serde_json::from_str(doc)
            .map_err(|e| Error::installation(format!("invalid JSON manifest: {e}")))?
    } else {
        serde_yaml::from_str(doc)
            .map_err(|e| Error::installation(format!("invalid YAML manifest: {e}")))?
    };

    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::installation("manifest missing apiVersion"))?
        .to_string();
    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::installation("manifest missing kind"))?
        .to_string();
    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::installation("manifest missing metadata.name"))?
        .to_string();

    // Namespaced objects without an explicit namespace land in the
    // extension's install namespace
    let namespace = if is_cluster_scoped(&kind) {
        None
    } else {
        Some(
            value
                .pointer("/metadata/namespace")
                .and_then(|v| v.as_str())
                .unwrap_or(&ext.spec.install_namespace)
                .to_string(),
        )
    };

    apply_management_labels(&mut value, ext);

    Ok(ParsedManifest {
        value,
        name,
        namespace,
        api_resource: build_api_resource(&api_version, &kind),
    })
}

fn apply_management_labels(value: &mut serde_json::Value, ext: &Extension) {
    let metadata = value
        .pointer_mut("/metadata")
        .and_then(|m| m.as_object_mut());
    if let Some(metadata) = metadata {
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(
                LABEL_MANAGED_BY.to_string(),
                serde_json::Value::String(LABEL_MANAGED_BY_TRELLIS.to_string()),
            );
            labels.insert(
                LABEL_EXTENSION.to_string(),
                serde_json::Value::String(
                    ext.metadata.name.clone().unwrap_or_default(),
                ),
            );
        }
    }
}

/// Parse apiVersion into (group, version)
fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind
fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Pluralize a Kubernetes resource kind with simple English rules
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x')
    {
        format!("{lower}es")
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Kinds that are cluster-scoped and must not be given a namespace
fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "PriorityClass"
            | "StorageClass"
            | "IngressClass"
            | "ValidatingWebhookConfiguration"
            | "MutatingWebhookConfiguration"
            | "APIService"
    )
}

fn release_name(ext: &Extension) -> String {
    format!(
        "trellis-release-{}",
        ext.metadata.name.as_deref().unwrap_or_default()
    )
}

fn impersonation_user(namespace: &str, service_account: &str) -> String {
    format!("system:serviceaccount:{namespace}:{service_account}")
}
