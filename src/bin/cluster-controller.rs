//! Provisions remote clusters for `ClusterRequest` objects.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use k8s_provisioner::cluster::{ClusterReconciler, KubeClusterStatusApi, ProvisionSettings};
use k8s_provisioner::config::{self, CommonArgs};
use k8s_provisioner::events::KubeEventPublisher;
use k8s_provisioner::provider::digitalocean::DEFAULT_ENDPOINT;
use k8s_provisioner::provider::{DigitalOcean, SecretCredentialStore};
use k8s_provisioner::{Context, Controller};
use kube_runtime::watcher;
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Base URL of the provider API.
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    provider_endpoint: String,

    /// Seconds between status queries while a cluster is being created.
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,

    /// Seconds to wait for a new cluster to report running.
    #[arg(long, default_value_t = 600)]
    provision_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_logging(cli.common.log_format);

    let client = config::client(cli.common.kubeconfig.as_deref())
        .await
        .context("failed to create kubernetes client")?;
    let provider = DigitalOcean::new(&cli.provider_endpoint)
        .with_context(|| format!("invalid provider endpoint {}", cli.provider_endpoint))?;

    let reconciler = ClusterReconciler::new(
        Arc::new(provider),
        Arc::new(SecretCredentialStore::new(client.clone())),
        Arc::new(KubeClusterStatusApi::new(client.clone())),
        Arc::new(KubeEventPublisher::new(
            client.clone(),
            ClusterReconciler::CONTROLLER_NAME,
        )),
        ProvisionSettings {
            poll_interval: Duration::from_secs(cli.poll_interval),
            timeout: Duration::from_secs(cli.provision_timeout),
        },
    );

    let controller = match &cli.common.namespace {
        Some(namespace) => {
            Controller::namespaced(client, reconciler, namespace, watcher::Config::default())
        }
        None => Controller::namespaced_all(client, reconciler, watcher::Config::default()),
    };

    info!(workers = cli.common.workers, "Starting cluster controller");
    controller
        .workers(cli.common.workers())
        .cache_sync_timeout(cli.common.cache_sync_timeout())
        .run(config::shutdown_signal())
        .await
        .context("cluster controller failed")?;
    info!("Cluster controller stopped");
    Ok(())
}
