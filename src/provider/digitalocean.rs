//! [`Provisioner`] backed by the DigitalOcean Kubernetes API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CreateCluster, Credential, ProviderError, Provisioner, RemoteState};

pub const DEFAULT_ENDPOINT: &str = "https://api.digitalocean.com/";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DigitalOcean {
    http: reqwest::Client,
    endpoint: Url,
}

impl DigitalOcean {
    /// Creates a client talking to `endpoint`, normally
    /// [`DEFAULT_ENDPOINT`].
    pub fn new(endpoint: &str) -> Result<Self, ProviderError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, endpoint })
    }

    fn clusters_url(&self, id: Option<&str>) -> Result<Url, ProviderError> {
        let mut clusters = self.endpoint.join("v2/kubernetes/clusters")?;
        if let Some(id) = id {
            // the id is one opaque segment, never extra path or query
            clusters
                .path_segments_mut()
                .map_err(|()| {
                    ProviderError::Endpoint(url::ParseError::RelativeUrlWithCannotBeABaseBase)
                })?
                .push(id);
        }
        Ok(clusters)
    }
}

#[derive(Serialize)]
struct CreateBody<'a> {
    name: &'a str,
    region: &'a str,
    version: &'a str,
    node_pools: Vec<NodePoolBody<'a>>,
}

#[derive(Serialize)]
struct NodePoolBody<'a> {
    name: &'a str,
    size: &'a str,
    count: u32,
}

#[derive(Deserialize)]
struct ClusterEnvelope {
    kubernetes_cluster: ClusterBody,
}

#[derive(Deserialize)]
struct ClusterBody {
    id: String,
    #[serde(default)]
    status: Option<ClusterStatusBody>,
}

#[derive(Deserialize)]
struct ClusterStatusBody {
    #[serde(default)]
    state: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

async fn check(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or(text);
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Provisioner for DigitalOcean {
    async fn create(
        &self,
        credential: &Credential,
        request: &CreateCluster,
    ) -> Result<String, ProviderError> {
        let body = CreateBody {
            name: &request.name,
            region: &request.region,
            version: &request.version,
            node_pools: request
                .node_pools
                .iter()
                .map(|pool| NodePoolBody {
                    name: &pool.name,
                    size: &pool.size,
                    count: pool.count,
                })
                .collect(),
        };
        let response = self
            .http
            .post(self.clusters_url(None)?)
            .bearer_auth(credential.token())
            .json(&body)
            .send()
            .await?;
        let cluster: ClusterEnvelope = check(response).await?.json().await?;
        debug!(cluster_id = %cluster.kubernetes_cluster.id, "Cluster creation accepted");
        Ok(cluster.kubernetes_cluster.id)
    }

    async fn status(
        &self,
        credential: &Credential,
        id: &str,
    ) -> Result<RemoteState, ProviderError> {
        let response = self
            .http
            .get(self.clusters_url(Some(id))?)
            .bearer_auth(credential.token())
            .send()
            .await?;
        let cluster: ClusterEnvelope = check(response).await?.json().await?;
        let state = cluster
            .kubernetes_cluster
            .status
            .map(|status| status.state)
            .unwrap_or_default();
        Ok(RemoteState::from(state.as_str()))
    }

    async fn delete(&self, credential: &Credential, id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.clusters_url(Some(id))?)
            .bearer_auth(credential.token())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
