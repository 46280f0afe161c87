//! The remote control plane that actually runs clusters, and the store the
//! credentials for it are read from.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use thiserror::Error;

use crate::controller::ObjectKey;

pub mod digitalocean;

pub use digitalocean::DigitalOcean;

/// Key inside the credential secret that holds the API token.
pub const TOKEN_KEY: &str = "token";

/// State of a remote cluster as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Provisioning,
    Running,
    Error,
    Unknown(String),
}

impl From<&str> for RemoteState {
    fn from(state: &str) -> Self {
        match state {
            "provisioning" => RemoteState::Provisioning,
            "running" => RemoteState::Running,
            "error" => RemoteState::Error,
            other => RemoteState::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteState::Provisioning => f.write_str("provisioning"),
            RemoteState::Running => f.write_str("running"),
            RemoteState::Error => f.write_str("error"),
            RemoteState::Unknown(state) => write!(f, "unknown ({state})"),
        }
    }
}

/// An API token for the provider. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Reference to the secret a credential lives in, written as
/// `<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialRef {
    pub namespace: String,
    pub name: String,
}

impl FromStr for CredentialRef {
    type Err = InvalidCredentialRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ObjectKey>() {
            Ok(ObjectKey {
                namespace: Some(namespace),
                name,
            }) => Ok(Self { namespace, name }),
            _ => Err(InvalidCredentialRef(s.to_owned())),
        }
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("credential reference {0:?} is not of the form <namespace>/<name>")]
pub struct InvalidCredentialRef(pub String);

/// Parameters of a cluster creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCluster {
    pub name: String,
    pub region: String,
    pub version: String,
    pub node_pools: Vec<NodePoolRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolRequest {
    pub name: String,
    pub size: String,
    pub count: u32,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to provider failed")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid provider endpoint")]
    Endpoint(#[from] url::ParseError),
}

/// Client for the remote cluster lifecycle API.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Requests a new cluster and returns the ID the provider assigned.
    async fn create(
        &self,
        credential: &Credential,
        request: &CreateCluster,
    ) -> Result<String, ProviderError>;

    async fn status(&self, credential: &Credential, id: &str) -> Result<RemoteState, ProviderError>;

    async fn delete(&self, credential: &Credential, id: &str) -> Result<(), ProviderError>;
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("secret {0} not found")]
    NotFound(CredentialRef),
    #[error("secret {reference} has no \"token\" key")]
    MissingToken { reference: CredentialRef },
    #[error("failed to read secret {reference}")]
    Kube {
        reference: CredentialRef,
        #[source]
        source: kube::Error,
    },
}

/// Resolves credential references to credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential(&self, reference: &CredentialRef) -> Result<Credential, CredentialError>;
}

/// [`CredentialStore`] reading the token out of a Kubernetes secret.
pub struct SecretCredentialStore {
    client: Client,
}

impl SecretCredentialStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialStore for SecretCredentialStore {
    async fn credential(&self, reference: &CredentialRef) -> Result<Credential, CredentialError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &reference.namespace);
        let secret = secrets
            .get_opt(&reference.name)
            .await
            .map_err(|source| CredentialError::Kube {
                reference: reference.clone(),
                source,
            })?
            .ok_or_else(|| CredentialError::NotFound(reference.clone()))?;
        token_from_secret(&secret).ok_or_else(|| CredentialError::MissingToken {
            reference: reference.clone(),
        })
    }
}

fn token_from_secret(secret: &Secret) -> Option<Credential> {
    let token = secret.data.as_ref()?.get(TOKEN_KEY)?;
    let token = String::from_utf8(token.0.clone()).ok()?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(Credential::new(token))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::ByteString;

    use super::*;

    #[test]
    fn credential_refs_need_a_namespace() {
        let reference: CredentialRef = "infra/do-token".parse().unwrap();
        assert_eq!(reference.namespace, "infra");
        assert_eq!(reference.name, "do-token");
        assert_eq!(reference.to_string(), "infra/do-token");
        assert!("do-token".parse::<CredentialRef>().is_err());
        assert!("/do-token".parse::<CredentialRef>().is_err());
    }

    #[test]
    fn remote_states_map_from_provider_strings() {
        assert_eq!(RemoteState::from("running"), RemoteState::Running);
        assert_eq!(RemoteState::from("provisioning"), RemoteState::Provisioning);
        assert_eq!(RemoteState::from("error"), RemoteState::Error);
        assert_eq!(
            RemoteState::from("degraded"),
            RemoteState::Unknown("degraded".to_owned())
        );
    }

    #[test]
    fn token_is_read_from_secret_data() {
        let mut data = BTreeMap::new();
        data.insert(TOKEN_KEY.to_owned(), ByteString(b"s3cret\n".to_vec()));
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        assert_eq!(token_from_secret(&secret), Some(Credential::new("s3cret")));
        assert_eq!(token_from_secret(&Secret::default()), None);
    }

    #[test]
    fn credentials_are_redacted() {
        assert_eq!(
            format!("{:?}", Credential::new("s3cret")),
            "Credential(<redacted>)"
        );
    }
}
