//! Command line options, client construction and logging setup shared by
//! the controller binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, warn};

use crate::error::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Options every controller accepts.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Path to a kubeconfig file. Falls back to the ambient configuration
    /// (environment, default kubeconfig, in-cluster) if it cannot be loaded.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Number of objects reconciled in parallel.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Only watch this namespace instead of all namespaces.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Seconds to wait for the initial listing before giving up.
    #[arg(long, default_value_t = 60)]
    pub cache_sync_timeout: u64,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl CommonArgs {
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout)
    }

    pub fn workers(&self) -> usize {
        usize::from(self.workers)
    }
}

/// Builds a client from `kubeconfig` if given, falling back to
/// [`Config::infer`] when that file cannot be used.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let config = match kubeconfig {
        Some(path) => match config_from_file(path).await {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to load kubeconfig, inferring configuration"
                );
                Config::infer().await.map_err(Error::InferConfig)?
            }
        },
        None => Config::infer().await.map_err(Error::InferConfig)?,
    };
    debug!(cluster_url = %config.cluster_url, "Kubernetes configuration loaded");
    Client::try_from(config).map_err(Error::Client)
}

async fn config_from_file(path: &Path) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(Error::Kubeconfig)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(Error::Kubeconfig)
}

/// Installs the global tracing subscriber. `RUST_LOG` selects the level,
/// `info` by default.
pub fn init_logging(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_file(true)
        .with_line_number(true)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
