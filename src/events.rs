//! Audit events attached to reconciled objects.
//!
//! Reconcilers receive an [`EventPublisher`] when they are constructed
//! instead of reaching for a process-wide recorder. Publishing is
//! fire-and-forget: a failure is logged and never fails the reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about the object `reference` points at.
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the Kubernetes events API.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// `controller_name` shows up as the reporting component of every
    /// event.
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_owned(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note,
            action: action.to_owned(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            warn!(reason, action, error = %err, "Failed to publish event");
        }
    }
}

pub mod reasons {
    /// The provider was asked to create the cluster.
    pub const CLUSTER_CREATION: &str = "ClusterCreation";
    /// The provider reports the cluster as running.
    pub const CLUSTER_CREATION_COMPLETED: &str = "ClusterCreationCompleted";
    /// The request cannot be acted on until the user changes it.
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

pub mod actions {
    pub const PROVISION: &str = "Provision";
    pub const VALIDATE: &str = "Validate";
}
