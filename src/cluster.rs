//! Reconciler that provisions a remote cluster for every `ClusterRequest`
//! and keeps the request's status in step with the provider.
//!
//! A new request is created at the provider once, its ID is persisted in
//! the status together with `phase: creating`, and the worker then polls the
//! provider until the cluster reports `running` (or the wait times out).
//! Deleting the request deletes the remote cluster.
//!
//! The poll blocks the worker for up to the provisioning timeout, so at most
//! `workers` clusters can be waited on at the same time. Requeueing with a
//! delay instead would free the worker, at the cost of spreading one
//! provisioning attempt over several reconciliations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use kube_runtime::events::EventType;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::controller::{default_error_action, Context, ErrorAction, ObjectKey};
use crate::crd::{ClusterRequest, ClusterRequestSpec, ClusterRequestStatus, Phase};
use crate::events::{actions, reasons, EventPublisher};
use crate::provider::{
    CreateCluster, Credential, CredentialError, CredentialRef, CredentialStore,
    InvalidCredentialRef, NodePoolRequest, ProviderError, Provisioner, RemoteState,
};
use crate::queue::Shutdown;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    InvalidCredentialRef(#[from] InvalidCredentialRef),
    #[error("spec.nodePools is empty, at least one node pool is required")]
    NoNodePools,
    #[error("failed to resolve provider credential")]
    Credential(#[from] CredentialError),
    #[error("provider request failed")]
    Provider(#[from] ProviderError),
    #[error("failed to update status of {key}")]
    Status {
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
    #[error("cluster {cluster_id} was not running after {timeout:?}")]
    ProvisionTimeout {
        cluster_id: String,
        timeout: Duration,
    },
    #[error("stopped waiting for cluster {cluster_id} because of shutdown")]
    Cancelled { cluster_id: String },
}

impl ClusterError {
    /// Errors that will keep happening until someone edits the request or
    /// its secret. These are not retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidCredentialRef(_)
                | ClusterError::NoNodePools
                | ClusterError::Credential(CredentialError::MissingToken { .. })
        )
    }
}

/// Reads and writes the status subresource of a `ClusterRequest`.
#[async_trait]
pub trait ClusterStatusApi: Send + Sync {
    /// The status as currently stored, which may be ahead of the cache.
    /// `None` if the request no longer exists.
    async fn fetch_status(&self, key: &ObjectKey)
        -> Result<Option<ClusterRequestStatus>, kube::Error>;

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &ClusterRequestStatus,
    ) -> Result<(), kube::Error>;
}

pub struct KubeClusterStatusApi {
    client: Client,
}

impl KubeClusterStatusApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ObjectKey) -> Api<ClusterRequest> {
        match &key.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterStatusApi for KubeClusterStatusApi {
    async fn fetch_status(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ClusterRequestStatus>, kube::Error> {
        let request = self.api(key).get_opt(&key.name).await?;
        Ok(request.map(|request| request.status.unwrap_or_default()))
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &ClusterRequestStatus,
    ) -> Result<(), kube::Error> {
        let api = self.api(key);
        // merge patch on the status subresource only touches the fields we
        // own and works against whatever version is current
        api.patch_status(
            &key.name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

/// What was provisioned for a request, kept so that the remote cluster can
/// still be deleted once the request itself is gone from the cache. The
/// credential is resolved again at deletion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub cluster_id: String,
    pub credential_ref: CredentialRef,
}

/// Per-key record of provisioned clusters.
///
/// Every key is owned by at most one worker at a time, so entries are never
/// contended; the lock only protects the map itself.
#[derive(Debug, Default)]
pub struct ProvisionLedger {
    entries: Mutex<HashMap<ObjectKey, Provisioned>>,
}

impl ProvisionLedger {
    fn entries(&self) -> MutexGuard<'_, HashMap<ObjectKey, Provisioned>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, key: ObjectKey, provisioned: Provisioned) {
        self.entries().insert(key, provisioned);
    }

    pub fn cluster_id(&self, key: &ObjectKey) -> Option<String> {
        self.entries()
            .get(key)
            .map(|provisioned| provisioned.cluster_id.clone())
    }

    pub fn take(&self, key: &ObjectKey) -> Option<Provisioned> {
        self.entries().remove(key)
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Time between two status queries while waiting for a cluster.
    pub poll_interval: Duration,
    /// Upper bound on one wait for a cluster to come up.
    pub timeout: Duration,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
        }
    }
}

pub struct ClusterReconciler {
    provisioner: Arc<dyn Provisioner>,
    credentials: Arc<dyn CredentialStore>,
    status: Arc<dyn ClusterStatusApi>,
    events: Arc<dyn EventPublisher>,
    ledger: ProvisionLedger,
    settings: ProvisionSettings,
}

impl ClusterReconciler {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        credentials: Arc<dyn CredentialStore>,
        status: Arc<dyn ClusterStatusApi>,
        events: Arc<dyn EventPublisher>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            provisioner,
            credentials,
            status,
            events,
            ledger: ProvisionLedger::default(),
            settings,
        }
    }

    /// Records the cluster a request points at before anything else can
    /// fail, so that deleting the request always reaches it.
    fn remember(&self, key: &ObjectKey, request: &ClusterRequest) {
        let Some(cluster_id) = request.cluster_id() else {
            return;
        };
        match request.spec.credential_ref.parse::<CredentialRef>() {
            Ok(credential_ref) => self.ledger.record(
                key.clone(),
                Provisioned {
                    cluster_id: cluster_id.to_owned(),
                    credential_ref,
                },
            ),
            Err(err) => warn!(
                key = %key,
                cluster_id,
                error = %err,
                "Cannot track cluster for deletion"
            ),
        }
    }

    async fn provision(
        &self,
        key: &ObjectKey,
        request: &ClusterRequest,
        reference: &ObjectReference,
        shutdown: &Shutdown,
    ) -> Result<(), ClusterError> {
        if request.phase() == Phase::Running && request.cluster_id().is_some() {
            debug!(key = %key, cluster_id = request.cluster_id(), "Cluster already running");
            return Ok(());
        }

        // our own status writes come back through the cache late, so the
        // stored status decides what is left to do
        let live = self
            .status
            .fetch_status(key)
            .await
            .map_err(|source| ClusterError::Status {
                key: key.clone(),
                source,
            })?;
        let Some(live) = live else {
            debug!(key = %key, "Request is gone, nothing to provision");
            return Ok(());
        };
        let live_id = live.cluster_id.as_deref().filter(|id| !id.is_empty());
        // the ledger covers a create whose status write failed
        let known_id = live_id
            .or(request.cluster_id())
            .map(str::to_owned)
            .or_else(|| self.ledger.cluster_id(key));

        if live.phase == Phase::Running {
            if let Some(cluster_id) = known_id {
                debug!(key = %key, cluster_id = %cluster_id, "Cluster already running");
                if let Ok(credential_ref) = request.spec.credential_ref.parse() {
                    self.ledger.record(
                        key.clone(),
                        Provisioned {
                            cluster_id,
                            credential_ref,
                        },
                    );
                }
                return Ok(());
            }
        }

        let credential_ref: CredentialRef = request.spec.credential_ref.parse()?;
        let create = create_request(key, &request.spec)?;
        let credential = self.credentials.credential(&credential_ref).await?;

        let cluster_id = match known_id {
            Some(cluster_id) => cluster_id,
            None => {
                let cluster_id = self.provisioner.create(&credential, &create).await?;
                info!(key = %key, cluster_id = %cluster_id, "Requested cluster from provider");
                self.events
                    .publish(
                        reference,
                        EventType::Normal,
                        reasons::CLUSTER_CREATION,
                        actions::PROVISION,
                        Some(format!("Provider was asked to create cluster {}", create.name)),
                    )
                    .await;
                cluster_id
            }
        };
        self.ledger.record(
            key.clone(),
            Provisioned {
                cluster_id: cluster_id.clone(),
                credential_ref,
            },
        );

        if live.phase != Phase::Creating || live_id != Some(cluster_id.as_str()) {
            self.write_status(key, &cluster_id, Phase::Creating).await?;
        }

        self.wait_until_running(&credential, &cluster_id, shutdown)
            .await?;

        self.write_status(key, &cluster_id, Phase::Running).await?;
        info!(key = %key, cluster_id = %cluster_id, "Cluster is running");
        self.events
            .publish(
                reference,
                EventType::Normal,
                reasons::CLUSTER_CREATION_COMPLETED,
                actions::PROVISION,
                Some(format!("Cluster {cluster_id} is running")),
            )
            .await;
        Ok(())
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        cluster_id: &str,
        phase: Phase,
    ) -> Result<(), ClusterError> {
        let status = ClusterRequestStatus {
            cluster_id: Some(cluster_id.to_owned()),
            phase,
        };
        self.status
            .patch_status(key, &status)
            .await
            .map_err(|source| ClusterError::Status {
                key: key.clone(),
                source,
            })?;
        debug!(key = %key, cluster_id, phase = %phase, "Status updated");
        Ok(())
    }

    async fn wait_until_running(
        &self,
        credential: &Credential,
        cluster_id: &str,
        shutdown: &Shutdown,
    ) -> Result<(), ClusterError> {
        let timeout = self.settings.timeout;
        let poll = tokio::time::timeout(timeout, self.poll_until_running(credential, cluster_id));
        tokio::select! {
            polled = poll => polled.unwrap_or_else(|_| Err(ClusterError::ProvisionTimeout {
                cluster_id: cluster_id.to_owned(),
                timeout,
            })),
            _ = shutdown.triggered() => Err(ClusterError::Cancelled {
                cluster_id: cluster_id.to_owned(),
            }),
        }
    }

    async fn poll_until_running(
        &self,
        credential: &Credential,
        cluster_id: &str,
    ) -> Result<(), ClusterError> {
        loop {
            match self.provisioner.status(credential, cluster_id).await? {
                RemoteState::Running => return Ok(()),
                RemoteState::Error => {
                    warn!(cluster_id, "Provider reports cluster in error state, still waiting")
                }
                state => debug!(cluster_id, state = %state, "Cluster not running yet"),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Records a permanent failure on the request, once.
    async fn mark_failed(
        &self,
        key: &ObjectKey,
        request: &ClusterRequest,
        reference: &ObjectReference,
        err: &ClusterError,
    ) {
        if request.phase() == Phase::Error {
            return;
        }
        let status = ClusterRequestStatus {
            cluster_id: request.cluster_id().map(str::to_owned),
            phase: Phase::Error,
        };
        if let Err(err) = self.status.patch_status(key, &status).await {
            warn!(key = %key, error = %err, "Failed to record error phase");
        }
        self.events
            .publish(
                reference,
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::VALIDATE,
                Some(err.to_string()),
            )
            .await;
    }
}

/// Builds the provider request. Only the first node pool is sent.
fn create_request(
    key: &ObjectKey,
    spec: &ClusterRequestSpec,
) -> Result<CreateCluster, ClusterError> {
    let pool = spec.node_pools.first().ok_or(ClusterError::NoNodePools)?;
    if spec.node_pools.len() > 1 {
        warn!(
            key = %key,
            ignored = spec.node_pools.len() - 1,
            "Only the first node pool is provisioned"
        );
    }
    Ok(CreateCluster {
        name: spec.name.clone(),
        region: spec.region.clone(),
        version: spec.version.clone(),
        node_pools: vec![NodePoolRequest {
            name: pool.name.clone(),
            size: pool.size.clone(),
            count: pool.count,
        }],
    })
}

#[async_trait]
impl Context for ClusterReconciler {
    type Resource = ClusterRequest;
    type Error = ClusterError;

    const CONTROLLER_NAME: &'static str = "cluster-controller";

    async fn apply(
        &self,
        request: &ClusterRequest,
        shutdown: &Shutdown,
    ) -> Result<(), ClusterError> {
        let Some(key) = ObjectKey::for_resource(request) else {
            return Ok(());
        };
        self.remember(&key, request);
        let reference = request.object_ref(&());
        let result = self.provision(&key, request, &reference, shutdown).await;
        if let Err(err) = &result {
            if err.is_permanent() {
                self.mark_failed(&key, request, &reference, err).await;
            }
        }
        result
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        let Some(provisioned) = self.ledger.take(key) else {
            info!(key = %key, "Request deleted, no remote cluster recorded");
            return Ok(());
        };
        let credential = match self.credentials.credential(&provisioned.credential_ref).await {
            Ok(credential) => credential,
            Err(err) => {
                error!(
                    key = %key,
                    cluster_id = %provisioned.cluster_id,
                    error = %err,
                    "Cannot delete remote cluster without credential, not retrying"
                );
                return Ok(());
            }
        };
        match self
            .provisioner
            .delete(&credential, &provisioned.cluster_id)
            .await
        {
            Ok(()) => info!(
                key = %key,
                cluster_id = %provisioned.cluster_id,
                "Remote cluster deleted"
            ),
            Err(err) => error!(
                key = %key,
                cluster_id = %provisioned.cluster_id,
                error = %err,
                "Failed to delete remote cluster, not retrying"
            ),
        }
        Ok(())
    }

    fn error_action(&self, key: &ObjectKey, err: &ClusterError, num_requeues: u32) -> ErrorAction {
        if err.is_permanent() {
            warn!(key = %key, error = %err, "Not retrying invalid request");
            return ErrorAction::Drop;
        }
        default_error_action(num_requeues)
    }
}
