//! Extension reconciliation controller
//!
//! Each pass drives one Extension through resolve → unpack → install,
//! writing the full canonical condition set after every step. Domain
//! failures surface exclusively through conditions and a requeue; the
//! reconciler only returns an error for process-level problems (unreachable
//! API server, collaborator I/O), which the error policy retries with
//! backoff and never writes into conditions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use trellis_catalog::{CatalogIndex, HttpCatalogIndex};
use trellis_common::conditions::{
    ensure_complete, is_condition_true, set_condition, ConditionStatus, REASON_INSTALLATION_FAILED,
    REASON_RESOLUTION_FAILED, REASON_SUCCESS, REASON_UNPACK_FAILED, REASON_UNPACK_PENDING,
    REASON_UNPACK_SUCCESS, TYPE_INSTALLED, TYPE_RESOLVED, TYPE_UNPACKED,
};
use trellis_common::crd::{Extension, ExtensionStatus};
use trellis_common::retry::backoff_delay;
use trellis_common::{
    Error, Result, FIELD_MANAGER, REQUEUE_SUCCESS_SECS, REQUEUE_UNPACK_PENDING_SECS,
    TEARDOWN_FINALIZER,
};
use trellis_resolver::resolve;

use crate::install::{Installer, ManifestInstaller};
use crate::unpack::{ArchiveUnpacker, UnpackResult, Unpacker};

/// Base delay for transient unpack/install failures
const FAST_BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Cap for transient unpack/install failures
const FAST_BACKOFF_MAX: Duration = Duration::from_secs(120);
/// Base delay for resolution-class failures, which usually need a catalog or
/// spec change to clear
const SLOW_BACKOFF_BASE: Duration = Duration::from_secs(30);
/// Cap for resolution-class failures
const SLOW_BACKOFF_MAX: Duration = Duration::from_secs(600);
/// Deadline applied to every collaborator call within a reconcile pass
const COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(60);

/// Trait abstracting the Kubernetes writes the reconciler performs.
///
/// Allows stubbing the API server in tests while the real client is used in
/// production.
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status subresource of an Extension
    async fn patch_extension_status(&self, name: &str, status: &ExtensionStatus) -> Result<()>;

    /// Add a finalizer to an Extension
    async fn add_finalizer(&self, ext: &Extension, finalizer: &str) -> Result<()>;

    /// Remove a finalizer from an Extension
    async fn remove_finalizer(&self, ext: &Extension, finalizer: &str) -> Result<()>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_extension_status(&self, name: &str, status: &ExtensionStatus) -> Result<()> {
        let api: Api<Extension> = Api::all(self.client.clone());
        // Build the patch manually instead of serializing ExtensionStatus:
        // merge patches need explicit `null` to clear resolvedBundle and
        // installedBundle, and `skip_serializing_if` would omit them, leaving
        // stale values behind.
        let patch = serde_json::json!({
            "status": {
                "conditions": status.conditions,
                "resolvedBundle": status.resolved_bundle,
                "installedBundle": status.installed_bundle,
            }
        });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, ext: &Extension, finalizer: &str) -> Result<()> {
        let api: Api<Extension> = Api::all(self.client.clone());
        let mut finalizers = ext.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            &ext.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, ext: &Extension, finalizer: &str) -> Result<()> {
        let api: Api<Extension> = Api::all(self.client.clone());
        let finalizers: Vec<String> = ext
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            &ext.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared context for Extension reconciliation
pub struct Context {
    /// Kubernetes write operations
    pub kube: Arc<dyn KubeClient>,
    /// Catalog index queried during resolution
    pub index: Arc<dyn CatalogIndex>,
    /// Bundle content retrieval
    pub unpacker: Arc<dyn Unpacker>,
    /// Applies bundle content to the cluster
    pub installer: Arc<dyn Installer>,
    /// Names of Extensions seen by the reconciler; the catalog watch maps
    /// content changes to every entry here
    pub known_extensions: Arc<DashMap<String, ()>>,
    /// Consecutive failure counts per object, reset on success
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a production context wired to real collaborators.
    ///
    /// The kube Config is kept so the installer can mint impersonated
    /// clients for each extension's service account.
    pub fn new(
        client: Client,
        config: kube::Config,
        content_cache_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self::with_collaborators(
            Arc::new(KubeClientImpl::new(client.clone())),
            Arc::new(HttpCatalogIndex::new(client.clone())),
            Arc::new(ArchiveUnpacker::new(content_cache_dir)),
            Arc::new(ManifestInstaller::with_impersonation(client, config)),
        )
    }

    /// Create a context from explicit collaborators (tests, alternative wiring)
    pub fn with_collaborators(
        kube: Arc<dyn KubeClient>,
        index: Arc<dyn CatalogIndex>,
        unpacker: Arc<dyn Unpacker>,
        installer: Arc<dyn Installer>,
    ) -> Self {
        Self {
            kube,
            index,
            unpacker,
            installer,
            known_extensions: Arc::new(DashMap::new()),
            failures: DashMap::new(),
        }
    }

    /// Record a failure for the object and return the requeue delay for it
    fn next_backoff(&self, name: &str, slow: bool) -> Duration {
        let mut attempt = self.failures.entry(name.to_string()).or_insert(0);
        let delay = if slow {
            backoff_delay(*attempt, SLOW_BACKOFF_BASE, SLOW_BACKOFF_MAX)
        } else {
            backoff_delay(*attempt, FAST_BACKOFF_BASE, FAST_BACKOFF_MAX)
        };
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Reset the failure count after a fully successful pass
    fn clear_backoff(&self, name: &str) {
        self.failures.remove(name);
    }
}

/// Enforce a deadline on a collaborator call so a hung dependency cannot
/// stall the worker; timeouts surface as retryable errors.
async fn with_deadline<T>(
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(COLLABORATOR_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::internal_with_context(
            what,
            format!("deadline of {}s exceeded", COLLABORATOR_TIMEOUT.as_secs()),
        )),
    }
}

fn has_finalizer(ext: &Extension) -> bool {
    ext.metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|name| name == TEARDOWN_FINALIZER))
        .unwrap_or(false)
}

/// Reconcile one Extension
pub async fn reconcile(ext: Arc<Extension>, ctx: Arc<Context>) -> std::result::Result<Action, Error> {
    let name = ext.name_any();
    let generation = ext.metadata.generation;
    info!(extension = %name, "reconciling extension");

    if ext.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&ext, &ctx).await;
    }

    ctx.known_extensions.insert(name.clone(), ());

    if !has_finalizer(&ext) {
        debug!(extension = %name, "adding teardown finalizer");
        ctx.kube.add_finalizer(&ext, TEARDOWN_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut status = ext.status.clone().unwrap_or_default();

    if let Err(message) = ext.spec.validate() {
        warn!(extension = %name, error = %message, "invalid extension spec");
        set_condition(
            &mut status.conditions,
            TYPE_RESOLVED,
            ConditionStatus::False,
            REASON_RESOLUTION_FAILED,
            &format!("invalid spec: {message}"),
            generation,
        );
        status.resolved_bundle = None;
        write_status(&ctx, &name, &mut status, generation).await?;
        // A spec change is required; requeueing cannot fix this
        return Ok(Action::await_change());
    }

    // The installed fact comes from the installer's release record, not from
    // our own previous status, so a lost status write cannot fork history
    let installed = with_deadline(
        "installed-fact",
        ctx.installer.get_installed_bundle(&ext),
    )
    .await?;

    let bundles = with_deadline(
        "catalog-index",
        ctx.index.list_bundles(&ext.spec.package_name),
    )
    .await?;

    let resolution = match resolve(&ext.spec, installed.as_ref(), &bundles) {
        Ok(resolution) => resolution,
        Err(e) => {
            let message = e.to_string();
            warn!(extension = %name, error = %message, "resolution failed");
            set_condition(
                &mut status.conditions,
                TYPE_RESOLVED,
                ConditionStatus::False,
                REASON_RESOLUTION_FAILED,
                &message,
                generation,
            );
            // Unpacked/Installed are left untouched: a failed re-resolution
            // must not regress the view of a working installation
            status.resolved_bundle = None;
            write_status(&ctx, &name, &mut status, generation).await?;
            return Ok(Action::requeue(ctx.next_backoff(&name, true)));
        }
    };

    let bundle = resolution.bundle;
    if resolution.deprecated {
        warn!(extension = %name, bundle = %bundle.name, "resolved bundle is deprecated in its catalog");
    }
    set_condition(
        &mut status.conditions,
        TYPE_RESOLVED,
        ConditionStatus::True,
        REASON_SUCCESS,
        &format!("resolved to {:?}", bundle.image),
        generation,
    );
    status.resolved_bundle = Some(bundle.metadata());

    // Dependency admissibility gates the winning bundle only; filtering
    // during the version scan would change which error users see
    if let Some(property) = bundle.unsupported_dependency() {
        let err = Error::unsupported_dependency(&bundle.name, property);
        let message = err.to_string();
        warn!(extension = %name, error = %message, "resolved bundle is inadmissible");
        set_condition(
            &mut status.conditions,
            TYPE_INSTALLED,
            ConditionStatus::False,
            REASON_INSTALLATION_FAILED,
            &message,
            generation,
        );
        write_status(&ctx, &name, &mut status, generation).await?;
        return Ok(Action::requeue(ctx.next_backoff(&name, true)));
    }

    // Idempotent steady state: the resolved bundle is already installed and
    // confirmed, so neither the unpacker nor the installer runs this pass
    if installed.as_ref() == Some(&bundle.metadata())
        && is_condition_true(&status.conditions, TYPE_INSTALLED)
    {
        debug!(extension = %name, bundle = %bundle.name, "already installed, nothing to do");
        write_status(&ctx, &name, &mut status, generation).await?;
        ctx.clear_backoff(&name);
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)));
    }

    let manifests = match with_deadline("unpacker", ctx.unpacker.unpack(&ext, &bundle)).await? {
        UnpackResult::Pending => {
            debug!(extension = %name, bundle = %bundle.name, "bundle content not ready yet");
            set_condition(
                &mut status.conditions,
                TYPE_UNPACKED,
                ConditionStatus::False,
                REASON_UNPACK_PENDING,
                &format!("unpack pending for bundle {}", bundle.name),
                generation,
            );
            write_status(&ctx, &name, &mut status, generation).await?;
            return Ok(Action::requeue(Duration::from_secs(
                REQUEUE_UNPACK_PENDING_SECS,
            )));
        }
        UnpackResult::Failed { message } => {
            warn!(extension = %name, bundle = %bundle.name, error = %message, "unpack failed");
            set_condition(
                &mut status.conditions,
                TYPE_UNPACKED,
                ConditionStatus::False,
                REASON_UNPACK_FAILED,
                &message,
                generation,
            );
            write_status(&ctx, &name, &mut status, generation).await?;
            return Ok(Action::requeue(ctx.next_backoff(&name, false)));
        }
        UnpackResult::Unpacked { manifests } => {
            set_condition(
                &mut status.conditions,
                TYPE_UNPACKED,
                ConditionStatus::True,
                REASON_UNPACK_SUCCESS,
                &format!("unpack successful: {} objects", manifests.len()),
                generation,
            );
            manifests
        }
    };

    match with_deadline(
        "installer",
        ctx.installer.install(&ext, &bundle, &manifests),
    )
    .await
    {
        Ok(()) => {
            info!(extension = %name, bundle = %bundle.name, "bundle installed");
            set_condition(
                &mut status.conditions,
                TYPE_INSTALLED,
                ConditionStatus::True,
                REASON_SUCCESS,
                &format!("Installed bundle {} successfully", bundle.name),
                generation,
            );
            status.installed_bundle = Some(bundle.metadata());
            write_status(&ctx, &name, &mut status, generation).await?;
            ctx.clear_backoff(&name);
            Ok(Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)))
        }
        Err(e) => {
            let message = e.to_string();
            warn!(extension = %name, bundle = %bundle.name, error = %message, "installation failed");
            set_condition(
                &mut status.conditions,
                TYPE_INSTALLED,
                ConditionStatus::False,
                REASON_INSTALLATION_FAILED,
                &message,
                generation,
            );
            write_status(&ctx, &name, &mut status, generation).await?;
            Ok(Action::requeue(ctx.next_backoff(&name, false)))
        }
    }
}

/// Teardown on deletion: uninstall applied content, then release the
/// finalizer so the API server can complete the delete.
async fn handle_deletion(ext: &Extension, ctx: &Context) -> std::result::Result<Action, Error> {
    let name = ext.name_any();
    ctx.known_extensions.remove(&name);

    if has_finalizer(ext) {
        info!(extension = %name, "extension deleted, tearing down installed content");
        with_deadline("uninstall", ctx.installer.uninstall(ext)).await?;
        ctx.kube.remove_finalizer(ext, TEARDOWN_FINALIZER).await?;
        info!(extension = %name, "teardown complete, finalizer removed");
    }

    Ok(Action::await_change())
}

/// Write status with the full canonical condition set present
async fn write_status(
    ctx: &Context,
    name: &str,
    status: &mut ExtensionStatus,
    generation: Option<i64>,
) -> Result<()> {
    ensure_complete(&mut status.conditions, generation);
    ctx.kube.patch_extension_status(name, status).await
}

/// Decide the requeue for a failed reconcile pass.
///
/// Conflicts are retried immediately against freshly watched state; every
/// other error backs off exponentially per object, on the slow cadence for
/// resolution-class failures.
pub fn error_policy(ext: Arc<Extension>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = ext.name_any();
    if error.is_conflict() {
        debug!(extension = %name, "write conflict, retrying with fresh state");
        return Action::requeue(Duration::from_secs(1));
    }
    warn!(extension = %name, error = %error, "reconciliation failed");
    Action::requeue(ctx.next_backoff(&name, error.is_slow_retry()))
}
