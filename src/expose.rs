//! Reconciler that exposes every `Deployment` through a `Service` and an
//! `Ingress` of the same name, and removes both when the deployment goes
//! away.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use kube::api::{DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::{Api, Client};
use thiserror::Error;
use tracing::info;

use crate::controller::{default_error_action, Context, ErrorAction, ObjectKey};
use crate::queue::Shutdown;

pub const PORT_NAME: &str = "http";
pub const PORT: i32 = 80;
pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const FIELD_MANAGER: &str = "expose-controller";

#[derive(Debug, Error)]
pub enum ExposeError {
    #[error("deployment {0} has no pod template labels to select on")]
    NoSelector(ObjectKey),
    #[error("failed to apply {kind} {key}")]
    Apply {
        kind: &'static str,
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
    #[error("failed to delete {kind} {key}")]
    Delete {
        kind: &'static str,
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },
}

/// Writes the objects that expose a deployment.
#[async_trait]
pub trait ExposeApi: Send + Sync {
    /// Creates or updates `service`.
    async fn apply_service(&self, service: &Service) -> Result<(), kube::Error>;

    /// Creates or updates `ingress`.
    async fn apply_ingress(&self, ingress: &Ingress) -> Result<(), kube::Error>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool, kube::Error>;
}

/// [`ExposeApi`] using server-side apply, so that applying an object that
/// already exists updates it instead of failing with a conflict.
pub struct KubeExposeApi {
    client: Client,
}

impl KubeExposeApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<bool, kube::Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ExposeApi for KubeExposeApi {
    async fn apply_service(&self, service: &Service) -> Result<(), kube::Error> {
        let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let name = service.metadata.name.as_deref().unwrap_or_default();
        api.patch(name, &apply_params(), &Patch::Apply(service))
            .await?;
        Ok(())
    }

    async fn apply_ingress(&self, ingress: &Ingress) -> Result<(), kube::Error> {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        api.patch(name, &apply_params(), &Patch::Apply(ingress))
            .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }
}

fn metadata(
    namespace: &str,
    name: &str,
    annotations: Option<BTreeMap<String, String>>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: Some(namespace.to_owned()),
        labels: Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_owned(),
            FIELD_MANAGER.to_owned(),
        )])),
        annotations,
        ..Default::default()
    }
}

/// The service selecting the deployment's pods, serving port 80 as `http`.
pub fn build_service(key: &ObjectKey, deployment: &Deployment) -> Result<Service, ExposeError> {
    let selector = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
        .filter(|labels| !labels.is_empty())
        .ok_or_else(|| ExposeError::NoSelector(key.clone()))?;
    Ok(Service {
        metadata: metadata(namespace_of(key), &key.name, None),
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_owned()),
                port: PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The ingress routing `/<name>` to port 80 of the service of the same
/// name, rewritten to `/`.
pub fn build_ingress(key: &ObjectKey) -> Ingress {
    let annotations = BTreeMap::from([(REWRITE_TARGET_ANNOTATION.to_owned(), "/".to_owned())]);
    Ingress {
        metadata: metadata(namespace_of(key), &key.name, Some(annotations)),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(format!("/{}", key.name)),
                        path_type: "Prefix".to_owned(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: key.name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn namespace_of(key: &ObjectKey) -> &str {
    key.namespace.as_deref().unwrap_or("default")
}

pub struct ExposeReconciler {
    api: Arc<dyn ExposeApi>,
}

impl ExposeReconciler {
    pub fn new(api: Arc<dyn ExposeApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Context for ExposeReconciler {
    type Resource = Deployment;
    type Error = ExposeError;

    const CONTROLLER_NAME: &'static str = "expose-controller";

    async fn apply(
        &self,
        deployment: &Deployment,
        _shutdown: &Shutdown,
    ) -> Result<(), ExposeError> {
        let Some(key) = ObjectKey::for_resource(deployment) else {
            return Ok(());
        };
        let service = build_service(&key, deployment)?;
        self.api
            .apply_service(&service)
            .await
            .map_err(|source| ExposeError::Apply {
                kind: "Service",
                key: key.clone(),
                source,
            })?;
        self.api
            .apply_ingress(&build_ingress(&key))
            .await
            .map_err(|source| ExposeError::Apply {
                kind: "Ingress",
                key: key.clone(),
                source,
            })?;
        info!(key = %key, path = %format!("/{}", key.name), "Deployment exposed");
        Ok(())
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<(), ExposeError> {
        let namespace = namespace_of(key);
        let service_deleted = self
            .api
            .delete_service(namespace, &key.name)
            .await
            .map_err(|source| ExposeError::Delete {
                kind: "Service",
                key: key.clone(),
                source,
            })?;
        let ingress_deleted = self
            .api
            .delete_ingress(namespace, &key.name)
            .await
            .map_err(|source| ExposeError::Delete {
                kind: "Ingress",
                key: key.clone(),
                source,
            })?;
        info!(
            key = %key,
            service_deleted,
            ingress_deleted,
            "Deployment deleted, exposure removed"
        );
        Ok(())
    }

    fn error_action(&self, _key: &ObjectKey, err: &ExposeError, num_requeues: u32) -> ErrorAction {
        match err {
            ExposeError::NoSelector(_) => ErrorAction::Drop,
            _ => default_error_action(num_requeues),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    use super::*;
    use crate::queue::{RateLimiter, WorkQueue};

    #[derive(Default)]
    struct FakeExposeApi {
        services: Mutex<BTreeMap<String, Service>>,
        ingresses: Mutex<BTreeMap<String, Ingress>>,
        deleted: Mutex<Vec<String>>,
        fail_service_delete: bool,
    }

    fn full_name(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    #[async_trait]
    impl ExposeApi for FakeExposeApi {
        async fn apply_service(&self, service: &Service) -> Result<(), kube::Error> {
            let name = full_name(
                service.metadata.namespace.as_deref().unwrap(),
                service.metadata.name.as_deref().unwrap(),
            );
            self.services.lock().unwrap().insert(name, service.clone());
            Ok(())
        }

        async fn apply_ingress(&self, ingress: &Ingress) -> Result<(), kube::Error> {
            let name = full_name(
                ingress.metadata.namespace.as_deref().unwrap(),
                ingress.metadata.name.as_deref().unwrap(),
            );
            self.ingresses.lock().unwrap().insert(name, ingress.clone());
            Ok(())
        }

        async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
            self.deleted.lock().unwrap().push(format!("service {name}"));
            if self.fail_service_delete {
                return Err(kube::Error::Service("unreachable".into()));
            }
            Ok(self
                .services
                .lock()
                .unwrap()
                .remove(&full_name(namespace, name))
                .is_some())
        }

        async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool, kube::Error> {
            self.deleted.lock().unwrap().push(format!("ingress {name}"));
            Ok(self
                .ingresses
                .lock()
                .unwrap()
                .remove(&full_name(namespace, name))
                .is_some())
        }
    }

    fn deployment(name: &str, labels: &[(&str, &str)]) -> Deployment {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("shop".to_owned()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup(api: FakeExposeApi) -> (Arc<FakeExposeApi>, ExposeReconciler, WorkQueue<ObjectKey>) {
        let api = Arc::new(api);
        let reconciler = ExposeReconciler::new(Arc::clone(&api) as Arc<dyn ExposeApi>);
        (api, reconciler, WorkQueue::new("test", RateLimiter::default()))
    }

    #[test]
    fn service_selects_pod_template_labels() {
        let key = ObjectKey::new(Some("shop"), "web");
        let web = deployment("web", &[("app", "web"), ("tier", "front")]);
        let service = build_service(&key, &web).unwrap();
        let spec = service.spec.unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("web"));
        assert_eq!(
            spec.selector,
            Some(BTreeMap::from([
                ("app".to_owned(), "web".to_owned()),
                ("tier".to_owned(), "front".to_owned())
            ]))
        );
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].port, 80);
    }

    #[test]
    fn ingress_routes_name_prefix_to_service() {
        let ingress = build_ingress(&ObjectKey::new(Some("shop"), "web"));
        assert_eq!(
            ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REWRITE_TARGET_ANNOTATION))
                .map(String::as_str),
            Some("/")
        );
        let rules = ingress.spec.unwrap().rules.unwrap();
        assert_eq!(rules.len(), 1);
        let paths = &rules[0].http.as_ref().unwrap().paths;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].path.as_deref(), Some("/web"));
        assert_eq!(paths[0].path_type, "Prefix");
        let backend = paths[0].backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "web");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
    }

    #[tokio::test]
    async fn apply_then_cleanup_round_trip() {
        let (api, reconciler, queue) = setup(FakeExposeApi::default());
        let shutdown = queue.shutdown_signal();
        let web = deployment("web", &[("app", "web")]);

        reconciler.apply(&web, &shutdown).await.unwrap();
        // re-delivery of the same object is harmless
        reconciler.apply(&web, &shutdown).await.unwrap();
        assert_eq!(
            api.services.lock().unwrap().keys().cloned().collect::<Vec<_>>(),
            vec!["shop/web".to_owned()]
        );
        assert_eq!(
            api.ingresses.lock().unwrap().keys().cloned().collect::<Vec<_>>(),
            vec!["shop/web".to_owned()]
        );

        reconciler
            .cleanup(&ObjectKey::new(Some("shop"), "web"))
            .await
            .unwrap();
        assert!(api.services.lock().unwrap().is_empty());
        assert!(api.ingresses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_stops_at_first_failed_deletion() {
        let (api, reconciler, _queue) = setup(FakeExposeApi {
            fail_service_delete: true,
            ..Default::default()
        });

        let err = reconciler
            .cleanup(&ObjectKey::new(Some("shop"), "web"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExposeError::Delete { kind: "Service", .. }));
        assert_eq!(*api.deleted.lock().unwrap(), vec!["service web".to_owned()]);
    }

    #[tokio::test]
    async fn deployment_without_labels_is_not_retried() {
        let (api, reconciler, queue) = setup(FakeExposeApi::default());
        let err = reconciler
            .apply(&deployment("bare", &[]), &queue.shutdown_signal())
            .await
            .unwrap_err();

        assert_eq!(
            reconciler.error_action(&ObjectKey::new(Some("shop"), "bare"), &err, 0),
            ErrorAction::Drop
        );
        assert!(api.services.lock().unwrap().is_empty());
    }
}
