use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use kube::api::Api;
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{watcher, WatchStreamExt};
use tokio::task::JoinSet;
use tracing::{event, Level};

use crate::error::Error;
use crate::queue::{RateLimiter, Shutdown, WorkQueue};

/// How many times a failing key is requeued before it is dropped.
pub const MAX_REQUEUES: u32 = 5;

/// The identity of a watched object: its namespace (if any) and name.
///
/// This is the only thing that travels through the work queue. Workers
/// always look the object up again in the cache, so a key that was queued
/// several times is reconciled against the latest state exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_owned),
            name: name.to_owned(),
        }
    }

    /// Returns `None` for objects that have no name yet.
    pub fn for_resource<K: Resource>(resource: &K) -> Option<Self> {
        let name = resource.meta().name.as_deref()?;
        Some(Self::new(resource.meta().namespace.as_deref(), name))
    }

    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        let object_ref = ObjectRef::new(&self.name);
        match &self.namespace {
            Some(namespace) => object_ref.within(namespace),
            None => object_ref,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key {0:?}, expected <namespace>/<name> or <name>")]
pub struct InvalidKey(pub String);

impl FromStr for ObjectKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None if !s.is_empty() => Ok(Self::new(None, s)),
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(Some(namespace), name))
            }
            _ => Err(InvalidKey(s.to_owned())),
        }
    }
}

/// What the worker pool does with a key whose reconciliation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Put the key back on the queue after its backoff.
    Requeue,
    /// Give up on the key until the next change notification for it.
    Drop,
}

/// The [`Context`] trait should be implemented in order to provide callbacks
/// for the objects watched by a [`Controller`].
#[async_trait::async_trait]
pub trait Context: Send + Sync + 'static {
    /// The type of Kubernetes [resource](Resource) that will be watched by
    /// the [`Controller`] this context is passed to.
    type Resource: Resource<DynamicType = ()>
        + Clone
        + fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static;
    /// The error type which will be returned by the [`apply`](Self::apply)
    /// and [`cleanup`](Self::cleanup) methods.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name used in logs to tell controllers apart.
    const CONTROLLER_NAME: &'static str;

    /// Called with the current cached state of an object whose key came off
    /// the queue. Must be idempotent: the same unchanged object can be
    /// delivered any number of times.
    ///
    /// `shutdown` resolves when the process is stopping; long waits should
    /// give up when it does.
    async fn apply(&self, resource: &Self::Resource, shutdown: &Shutdown)
        -> Result<(), Self::Error>;

    /// Called when a key came off the queue but the object is no longer in
    /// the cache, i.e. it was deleted.
    async fn cleanup(&self, key: &ObjectKey) -> Result<(), Self::Error>;

    /// Decides whether a failed key is retried. `num_requeues` counts the
    /// retries already spent on this key since its last success. The
    /// default requeues until [`MAX_REQUEUES`] is reached.
    fn error_action(&self, key: &ObjectKey, err: &Self::Error, num_requeues: u32) -> ErrorAction {
        // use better names for the parameters in the docs
        let _key = key;
        let _err = err;

        default_error_action(num_requeues)
    }
}

/// Requeues until [`MAX_REQUEUES`] is reached, then drops. This is what
/// [`Context::error_action`] does unless overridden.
pub fn default_error_action(num_requeues: u32) -> ErrorAction {
    if num_requeues < MAX_REQUEUES {
        ErrorAction::Requeue
    } else {
        ErrorAction::Drop
    }
}

/// Feeds watch notifications into the cache and turns them into keys on the
/// work queue.
///
/// Only the key crosses into the queue. Updates are not treated specially:
/// every notification, including a full re-list, re-enqueues the affected
/// keys and the reconciler works out what changed.
pub struct EventBridge<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Writer<K>,
    queue: WorkQueue<ObjectKey>,
}

impl<K> EventBridge<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(writer: Writer<K>, queue: WorkQueue<ObjectKey>) -> Self {
        Self { writer, queue }
    }

    /// Applies `event` to the cache, then enqueues every key it touched. A
    /// re-list also enqueues keys that were cached before but are missing
    /// from the new listing, since their delete notification was lost.
    pub fn handle(&mut self, event: watcher::Event<K>) {
        let mut keys = HashSet::new();
        match &event {
            watcher::Event::Applied(obj) | watcher::Event::Deleted(obj) => {
                keys.extend(ObjectKey::for_resource(obj));
            }
            watcher::Event::Restarted(objs) => {
                keys.extend(objs.iter().filter_map(ObjectKey::for_resource));
                let vanished: Vec<_> = self
                    .writer
                    .as_reader()
                    .state()
                    .iter()
                    .filter_map(|obj| ObjectKey::for_resource(obj.as_ref()))
                    .filter(|key| !keys.contains(key))
                    .collect();
                keys.extend(vanished);
            }
        }
        self.writer.apply_watcher_event(&event);
        for key in keys {
            event!(Level::DEBUG, key = %key, "Enqueueing {}.", K::kind(&()));
            self.queue.add(key);
        }
    }
}

/// The [`Controller`] watches a set of resources, calling methods on the
/// provided [`Context`] for every key that comes off its work queue.
pub struct Controller<Ctx: Context> {
    api: Api<Ctx::Resource>,
    watcher_config: watcher::Config,
    context: Arc<Ctx>,
    workers: usize,
    cache_sync_timeout: Duration,
    rate_limiter: RateLimiter,
}

impl<Ctx: Context> Controller<Ctx> {
    /// Creates a new controller for a namespaced resource using the given
    /// `client`. The resources to be watched will be limited to resources
    /// in the given `namespace`. A [`watcher::Config`] can be given to
    /// limit the resources watched (for instance,
    /// `watcher::Config::default().labels("app=myapp")`).
    pub fn namespaced(
        client: Client,
        context: Ctx,
        namespace: &str,
        watcher_config: watcher::Config,
    ) -> Self
    where
        Ctx::Resource: Resource<Scope = NamespaceResourceScope>,
    {
        Self::with_api(
            Api::namespaced(client, namespace),
            context,
            watcher_config,
        )
    }

    /// Creates a new controller for a namespaced resource using the given
    /// `client`. The resources to be watched will not be limited by
    /// namespace.
    pub fn namespaced_all(client: Client, context: Ctx, watcher_config: watcher::Config) -> Self
    where
        Ctx::Resource: Resource<Scope = NamespaceResourceScope>,
    {
        Self::with_api(Api::all(client), context, watcher_config)
    }

    fn with_api(api: Api<Ctx::Resource>, context: Ctx, watcher_config: watcher::Config) -> Self {
        Self {
            api,
            watcher_config,
            context: Arc::new(context),
            workers: 2,
            cache_sync_timeout: Duration::from_secs(60),
            rate_limiter: RateLimiter::default(),
        }
    }

    /// Number of keys reconciled in parallel. At least one worker always
    /// runs.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// How long [`run`](Self::run) waits for the initial listing before
    /// giving up.
    pub fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Run the controller until `shutdown` resolves.
    ///
    /// The cache is filled first; if it does not sync within the configured
    /// timeout an error is returned and no worker is started. On shutdown
    /// the queue stops handing out keys, workers finish the key they are on
    /// and this method returns once all of them have exited.
    pub async fn run<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: std::future::Future<Output = ()>,
    {
        let Self {
            api,
            watcher_config,
            context,
            workers,
            cache_sync_timeout,
            rate_limiter,
        } = self;
        let kind = Ctx::Resource::kind(&()).into_owned();

        let queue = WorkQueue::new(kind.clone(), rate_limiter);
        let writer = Writer::<Ctx::Resource>::default();
        let store = writer.as_reader();
        let mut bridge = EventBridge::new(writer, queue.clone());

        let mut events = watcher(api, watcher_config).default_backoff().boxed();
        let bridge_task = tokio::spawn({
            let kind = kind.clone();
            async move {
                while let Some(notification) = events.next().await {
                    match notification {
                        Ok(notification) => bridge.handle(notification),
                        Err(err) => event!(
                            Level::WARN,
                            err = %err,
                            controller = Ctx::CONTROLLER_NAME,
                            "{} watch error.",
                            kind
                        ),
                    }
                }
            }
        });

        event!(
            Level::INFO,
            controller = Ctx::CONTROLLER_NAME,
            "Waiting for {} cache to sync.",
            kind
        );
        let synced = tokio::time::timeout(cache_sync_timeout, store.wait_until_ready()).await;
        let sync_error = match synced {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some(Error::CacheSyncAborted { kind: kind.clone() }),
            Err(_) => Some(Error::CacheSyncTimeout {
                kind: kind.clone(),
                timeout: cache_sync_timeout,
            }),
        };
        if let Some(err) = sync_error {
            bridge_task.abort();
            queue.shutdown();
            return Err(err);
        }

        event!(
            Level::INFO,
            controller = Ctx::CONTROLLER_NAME,
            workers,
            "Starting {} workers.",
            kind
        );
        let mut pool = spawn_workers(&queue, &store, &context, workers);

        shutdown.await;
        event!(
            Level::INFO,
            controller = Ctx::CONTROLLER_NAME,
            "Shutting down {} controller.",
            kind
        );
        queue.shutdown();
        bridge_task.abort();
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                event!(
                    Level::ERROR,
                    err = %err,
                    controller = Ctx::CONTROLLER_NAME,
                    "{} worker panicked.",
                    kind
                );
            }
        }
        Ok(())
    }
}

/// Starts `workers` tasks that keep pulling keys from `queue` until it is
/// shut down.
pub fn spawn_workers<Ctx: Context>(
    queue: &WorkQueue<ObjectKey>,
    store: &Store<Ctx::Resource>,
    context: &Arc<Ctx>,
    workers: usize,
) -> JoinSet<()> {
    let mut pool = JoinSet::new();
    for _ in 0..workers.max(1) {
        let queue = queue.clone();
        let store = store.clone();
        let context = Arc::clone(context);
        pool.spawn(async move {
            let shutdown = queue.shutdown_signal();
            while process_next_item(&queue, &store, context.as_ref(), &shutdown).await {}
        });
    }
    pool
}

/// Takes one key off the queue and reconciles it. Returns `false` once the
/// queue has been shut down.
async fn process_next_item<Ctx: Context>(
    queue: &WorkQueue<ObjectKey>,
    store: &Store<Ctx::Resource>,
    context: &Ctx,
    shutdown: &Shutdown,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };
    let kind = Ctx::Resource::kind(&()).into_owned();

    let result = match store.get(&key.object_ref()) {
        Some(resource) => {
            event!(
                Level::INFO,
                key = %key,
                resource_version = %resource.resource_version().unwrap_or_default(),
                controller = Ctx::CONTROLLER_NAME,
                "Reconciling {} (apply).",
                kind
            );
            context.apply(&resource, shutdown).await
        }
        None => {
            event!(
                Level::INFO,
                key = %key,
                controller = Ctx::CONTROLLER_NAME,
                "Reconciling {} (cleanup).",
                kind
            );
            context.cleanup(&key).await
        }
    };

    match result {
        Ok(()) => {
            queue.forget(&key);
            event!(
                Level::INFO,
                key = %key,
                controller = Ctx::CONTROLLER_NAME,
                "{} reconciliation successful.",
                kind
            );
        }
        Err(err) => {
            let num_requeues = queue.num_requeues(&key);
            match context.error_action(&key, &err, num_requeues) {
                ErrorAction::Requeue => {
                    event!(
                        Level::WARN,
                        key = %key,
                        err = %err,
                        num_requeues,
                        controller = Ctx::CONTROLLER_NAME,
                        "{} reconciliation error, requeueing.",
                        kind
                    );
                    queue.add_rate_limited(key.clone());
                }
                ErrorAction::Drop => {
                    queue.forget(&key);
                    event!(
                        Level::ERROR,
                        key = %key,
                        err = %err,
                        source = std::error::Error::source(&err),
                        num_requeues,
                        controller = Ctx::CONTROLLER_NAME,
                        "{} reconciliation error, dropping key.",
                        kind
                    );
                }
            }
        }
    }
    queue.done(&key);
    true
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;

    fn config_map(namespace: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct TestError(&'static str);

    #[derive(Default)]
    struct Recorder {
        failures_left: AtomicUsize,
        always_fail: bool,
        permanent: bool,
        applied: AtomicUsize,
        cleaned: Mutex<Vec<ObjectKey>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        apply_delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl Context for Recorder {
        type Resource = ConfigMap;
        type Error = TestError;

        const CONTROLLER_NAME: &'static str = "test";

        async fn apply(&self, _: &ConfigMap, _: &Shutdown) -> Result<(), TestError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.applied.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.apply_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.always_fail {
                return Err(TestError("always"));
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TestError("transient"));
            }
            Ok(())
        }

        async fn cleanup(&self, key: &ObjectKey) -> Result<(), TestError> {
            self.cleaned.lock().unwrap().push(key.clone());
            Ok(())
        }

        fn error_action(&self, _: &ObjectKey, _: &TestError, num_requeues: u32) -> ErrorAction {
            if self.permanent {
                ErrorAction::Drop
            } else {
                default_error_action(num_requeues)
            }
        }
    }

    fn harness(
        objects: &[ConfigMap],
    ) -> (WorkQueue<ObjectKey>, Store<ConfigMap>, EventBridge<ConfigMap>) {
        let queue = WorkQueue::new(
            "test",
            RateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)),
        );
        let writer = Writer::<ConfigMap>::default();
        let store = writer.as_reader();
        let mut bridge = EventBridge::new(writer, queue.clone());
        bridge.handle(watcher::Event::Restarted(objects.to_vec()));
        (queue, store, bridge)
    }

    async fn stop(queue: &WorkQueue<ObjectKey>, mut pool: JoinSet<()>) {
        queue.shutdown();
        while let Some(joined) = pool.join_next().await {
            joined.unwrap();
        }
    }

    #[test]
    fn object_keys_parse_and_display() {
        let key: ObjectKey = "default/web".parse().unwrap();
        assert_eq!(key, ObjectKey::new(Some("default"), "web"));
        assert_eq!(key.to_string(), "default/web");
        let key: ObjectKey = "node-1".parse().unwrap();
        assert_eq!(key.namespace, None);
        assert!("".parse::<ObjectKey>().is_err());
        assert!("default/".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn retries_stop_at_the_requeue_ceiling() {
        assert_eq!(default_error_action(0), ErrorAction::Requeue);
        assert_eq!(default_error_action(MAX_REQUEUES - 1), ErrorAction::Requeue);
        assert_eq!(default_error_action(MAX_REQUEUES), ErrorAction::Drop);
    }

    #[tokio::test]
    async fn bridge_updates_cache_then_enqueues_key() {
        let (queue, store, mut bridge) = harness(&[]);
        assert!(queue.is_empty());

        bridge.handle(watcher::Event::Applied(config_map("default", "web")));
        let key = ObjectKey::new(Some("default"), "web");
        assert!(store.get(&key.object_ref()).is_some());
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);

        bridge.handle(watcher::Event::Deleted(config_map("default", "web")));
        assert!(store.get(&key.object_ref::<ConfigMap>()).is_none());
        assert_eq!(queue.get().await, Some(key));
    }

    #[tokio::test]
    async fn relist_enqueues_objects_that_vanished() {
        let (queue, store, mut bridge) =
            harness(&[config_map("default", "a"), config_map("default", "b")]);
        assert_eq!(queue.len(), 2);
        while let Some(key) = queue.get().await {
            queue.done(&key);
            if queue.is_empty() {
                break;
            }
        }

        bridge.handle(watcher::Event::Restarted(vec![config_map("default", "a")]));
        let mut keys = vec![queue.get().await.unwrap(), queue.get().await.unwrap()];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ObjectKey::new(Some("default"), "a"),
                ObjectKey::new(Some("default"), "b")
            ]
        );
        assert!(store
            .get(&ObjectKey::new(Some("default"), "b").object_ref::<ConfigMap>())
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_forgets_retry_history() {
        let (queue, store, _bridge) = harness(&[config_map("default", "web")]);
        let context = Arc::new(Recorder {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let pool = spawn_workers(&queue, &store, &context, 1);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(context.applied.load(Ordering::SeqCst), 3);
        assert_eq!(
            queue.num_requeues(&ObjectKey::new(Some("default"), "web")),
            0
        );
        stop(&queue, pool).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_key_is_retried_five_times_then_dropped() {
        let (queue, store, _bridge) = harness(&[config_map("default", "web")]);
        let context = Arc::new(Recorder {
            always_fail: true,
            ..Default::default()
        });
        let pool = spawn_workers(&queue, &store, &context, 2);
        tokio::time::sleep(Duration::from_secs(60)).await;

        // one initial attempt plus five retries
        assert_eq!(context.applied.load(Ordering::SeqCst), 6);
        assert!(queue.is_empty());
        assert_eq!(
            queue.num_requeues(&ObjectKey::new(Some("default"), "web")),
            0
        );
        stop(&queue, pool).await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let (queue, store, _bridge) = harness(&[config_map("default", "web")]);
        let context = Arc::new(Recorder {
            always_fail: true,
            permanent: true,
            ..Default::default()
        });
        let pool = spawn_workers(&queue, &store, &context, 1);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(context.applied.load(Ordering::SeqCst), 1);
        stop(&queue, pool).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_objects_are_cleaned_up() {
        let (queue, store, mut bridge) = harness(&[config_map("default", "web")]);
        bridge.handle(watcher::Event::Deleted(config_map("default", "web")));
        let context = Arc::new(Recorder::default());
        let pool = spawn_workers(&queue, &store, &context, 1);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(context.applied.load(Ordering::SeqCst), 0);
        assert_eq!(
            *context.cleaned.lock().unwrap(),
            vec![ObjectKey::new(Some("default"), "web")]
        );
        stop(&queue, pool).await;
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_is_never_reconciled_concurrently() {
        let (queue, store, mut bridge) = harness(&[config_map("default", "web")]);
        let context = Arc::new(Recorder {
            apply_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let pool = spawn_workers(&queue, &store, &context, 4);

        for round in 0..20 {
            let mut labels = BTreeMap::new();
            labels.insert("round".to_owned(), round.to_string());
            let mut obj = config_map("default", "web");
            obj.metadata.labels = Some(labels);
            bridge.handle(watcher::Event::Applied(obj.clone()));
            bridge.handle(watcher::Event::Applied(obj));
            tokio::time::sleep(Duration::from_millis(7)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(context.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(context.applied.load(Ordering::SeqCst) >= 2);
        stop(&queue, pool).await;
    }
}
