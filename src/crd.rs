//! The `ClusterRequest` custom resource.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a remote Kubernetes cluster.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "provisioner.dev",
    version = "v1alpha1",
    kind = "ClusterRequest",
    namespaced,
    status = "ClusterRequestStatus",
    shortname = "creq",
    printcolumn = r#"{"name":"ClusterID","type":"string","jsonPath":".status.clusterID"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequestSpec {
    /// Name of the cluster at the provider.
    pub name: String,
    pub region: String,
    pub version: String,
    /// `<namespace>/<name>` of the secret holding the provider token.
    pub credential_ref: String,
    /// Only the first pool is sent to the provider; further pools are
    /// accepted and ignored.
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct NodePool {
    pub name: String,
    pub size: String,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct ClusterRequestStatus {
    #[serde(rename = "clusterID", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub phase: Phase,
}

/// Provisioning progress of the remote cluster.
///
/// On the success path the phase only ever moves forward, from
/// [`Unset`](Phase::Unset) through [`Creating`](Phase::Creating) to
/// [`Running`](Phase::Running).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Creating,
    Running,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Unset => "unset",
            Phase::Creating => "creating",
            Phase::Running => "running",
            Phase::Error => "error",
        })
    }
}

impl ClusterRequest {
    pub fn phase(&self) -> Phase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.cluster_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
