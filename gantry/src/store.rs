//! The pod template store.
//!
//! The store is a namespace-scoped registry of named pod templates read
//! during pod construction. Entries are installed by the template informer,
//! which watches the cluster for pod template changes; construction only ever
//! reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PodTemplate;
use kube::Api;
use kube::Client;
use kube::ResourceExt;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use tokio::pin;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// A namespace-scoped registry of named pod templates.
///
/// Readers receive a stable snapshot of a template and never block other
/// readers; the informer is the only writer.
pub struct PodTemplateStore {
    /// The stored templates, keyed by namespace and then name.
    templates: RwLock<HashMap<String, HashMap<String, Arc<PodTemplate>>>>,
    /// The namespace holding cluster-wide default templates.
    cluster_namespace: String,
}

impl PodTemplateStore {
    /// Creates an empty store.
    ///
    /// Templates in the given namespace serve as cluster-wide defaults for
    /// lookups in namespaces without an entry of their own.
    pub fn new(cluster_namespace: impl Into<String>) -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
            cluster_namespace: cluster_namespace.into(),
        }
    }

    /// Gets the template with the given name in the given namespace.
    ///
    /// Falls back to the cluster-wide entry with the same name when the
    /// namespace has none. Returns `None` when neither exists or the name is
    /// empty.
    pub fn load_or_default(&self, namespace: &str, name: &str) -> Option<Arc<PodTemplate>> {
        if name.is_empty() {
            return None;
        }

        let templates = self.templates.read().expect("lock should not be poisoned");
        templates
            .get(namespace)
            .and_then(|templates| templates.get(name))
            .or_else(|| {
                templates
                    .get(&self.cluster_namespace)
                    .and_then(|templates| templates.get(name))
            })
            .cloned()
    }

    /// Installs a template into the store, replacing any existing entry with
    /// the same namespace and name.
    pub fn insert(&self, template: PodTemplate) {
        let name = template.name_any();
        if name.is_empty() {
            warn!("ignoring pod template without a name");
            return;
        }

        let namespace = template.namespace().unwrap_or_default();
        debug!("storing pod template `{name}` in namespace `{namespace}`");

        self.templates
            .write()
            .expect("lock should not be poisoned")
            .entry(namespace)
            .or_default()
            .insert(name, Arc::new(template));
    }

    /// Removes the template with the given name from the given namespace.
    pub fn remove(&self, namespace: &str, name: &str) {
        debug!("removing pod template `{name}` from namespace `{namespace}`");

        let mut templates = self.templates.write().expect("lock should not be poisoned");
        if let Some(namespaced) = templates.get_mut(namespace) {
            namespaced.remove(name);
            if namespaced.is_empty() {
                templates.remove(namespace);
            }
        }
    }
}

/// Keeps a [`PodTemplateStore`] synchronized with the cluster.
pub struct TemplateInformer {
    /// The cancellation token for shutting down the informer.
    shutdown: CancellationToken,
    /// The handle to the watch task.
    handle: JoinHandle<()>,
}

impl TemplateInformer {
    /// Spawns an informer feeding the given store from the cluster's pod
    /// templates.
    pub fn spawn(client: Client, store: Arc<PodTemplateStore>) -> Self {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Self::watch_templates(client, store, shutdown.clone()));
        Self { shutdown, handle }
    }

    /// Shuts down the informer.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.handle.await.expect("failed to join task");
    }

    /// Watches cluster pod template events and applies them to the store.
    async fn watch_templates(
        client: Client,
        store: Arc<PodTemplateStore>,
        shutdown: CancellationToken,
    ) {
        info!("pod template informer has started");

        let api: Api<PodTemplate> = Api::all(client);
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        pin!(stream);

        loop {
            select! {
                biased;

                _ = shutdown.cancelled() => break,
                event = stream.next() => {
                    match event {
                        Some(Ok(Event::Apply(template) | Event::InitApply(template))) => {
                            store.insert(template);
                        }
                        Some(Ok(Event::Delete(template))) => {
                            store.remove(
                                template.namespace().unwrap_or_default().as_str(),
                                &template.name_any(),
                            );
                        }
                        Some(Ok(Event::Init | Event::InitDone)) => continue,
                        Some(Err(e)) => {
                            error!("error while streaming pod template events: {e}");
                        }
                        None => break,
                    }
                }
            }
        }

        info!("pod template informer has shut down");
    }
}
