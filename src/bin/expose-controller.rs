//! Exposes every `Deployment` through a `Service` and an `Ingress`.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use k8s_provisioner::config::{self, CommonArgs};
use k8s_provisioner::expose::{ExposeReconciler, KubeExposeApi};
use k8s_provisioner::Controller;
use kube_runtime::watcher;
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_logging(cli.common.log_format);

    let client = config::client(cli.common.kubeconfig.as_deref())
        .await
        .context("failed to create kubernetes client")?;
    let reconciler = ExposeReconciler::new(Arc::new(KubeExposeApi::new(client.clone())));

    let controller = match &cli.common.namespace {
        Some(namespace) => {
            Controller::namespaced(client, reconciler, namespace, watcher::Config::default())
        }
        None => Controller::namespaced_all(client, reconciler, watcher::Config::default()),
    };

    info!(workers = cli.common.workers, "Starting expose controller");
    controller
        .workers(cli.common.workers())
        .cache_sync_timeout(cli.common.cache_sync_timeout())
        .run(config::shutdown_signal())
        .await
        .context("expose controller failed")?;
    info!("Expose controller stopped");
    Ok(())
}
