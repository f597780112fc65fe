//! Trellis operator - catalog-driven extension lifecycle management

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis_common::crd::{Catalog, Extension};
use trellis_common::FIELD_MANAGER;
use trellis_operator::controller_runner::build_extension_controller;
use trellis_operator::Context;

/// Trellis - CRD-driven operator for catalog-served extension lifecycles
#[derive(Parser, Debug)]
#[command(name = "trellis-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Directory bundle content is cached under
    #[arg(long, default_value = "/var/cache/trellis/bundles")]
    content_cache: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let extension_crd = serde_yaml::to_string(&Extension::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Extension CRD: {}", e))?;
        let catalog_crd = serde_yaml::to_string(&Catalog::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Catalog CRD: {}", e))?;
        println!("{extension_crd}---\n{catalog_crd}");
        return Ok(());
    }

    let config = kube::Config::infer().await?;
    let client = Client::try_from(config.clone())?;
    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::new(client.clone(), config, cli.content_cache));

    tracing::info!("Starting controllers:");
    build_extension_controller(client, ctx).await;

    tracing::info!("Controller stopped, exiting");
    Ok(())
}

/// Ensure all Trellis CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply, so
/// the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Extension CRD...");
    crds.patch(
        "extensions.trellis.dev",
        &params,
        &Patch::Apply(&Extension::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Extension CRD: {}", e))?;

    tracing::info!("Installing Catalog CRD...");
    crds.patch(
        "catalogs.trellis.dev",
        &params,
        &Patch::Apply(&Catalog::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Catalog CRD: {}", e))?;

    tracing::info!("All Trellis CRDs installed/updated");
    Ok(())
}
