//! Controller runner - builds the Extension controller future
//!
//! Construction is kept pure so the caller (main, tests) composes and drives
//! the returned future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing::debug;

use trellis_common::crd::{Catalog, Extension};

use crate::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than the client read timeout so
/// the API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the Extension controller future.
///
/// Watches Extension objects, and additionally watches Catalog objects so a
/// catalog content change re-triggers every known Extension: new bundles
/// must cause re-resolution without any change to the Extension specs.
pub fn build_extension_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let extensions: Api<Extension> = Api::all(client.clone());
    let catalogs: Api<Catalog> = Api::all(client);

    let known = ctx.known_extensions.clone();

    tracing::info!("- Extension controller");

    Box::pin(
        Controller::new(
            extensions,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .watches(
            catalogs,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |catalog| {
                debug!(
                    catalog = ?catalog.metadata.name,
                    extensions = known.len(),
                    "catalog changed, re-triggering extensions"
                );
                known
                    .iter()
                    .map(|entry| ObjectRef::<Extension>::new(entry.key()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Extension")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => {
                tracing::debug!(?action, "{} reconciliation completed", controller_name)
            }
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
