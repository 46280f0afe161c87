use std::time::Duration;

use thiserror::Error;

/// Errors that stop a [`Controller`](crate::Controller) from running.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cache for {kind} did not sync within {timeout:?}")]
    CacheSyncTimeout { kind: String, timeout: Duration },
    #[error("cache for {kind} stopped before it finished syncing")]
    CacheSyncAborted { kind: String },
    #[error("failed to build kubernetes client")]
    Client(#[source] kube::Error),
    #[error("failed to load kubeconfig")]
    Kubeconfig(#[source] kube::config::KubeconfigError),
    #[error("failed to infer kubernetes configuration")]
    InferConfig(#[source] kube::config::InferConfigError),
}
