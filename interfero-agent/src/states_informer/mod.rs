//! Live snapshot of the local node and the pods scheduled to it
//!
//! A fixed set of sub-watchers ("informer plugins") each maintain one part of
//! the state. The informer is synced once every plugin has completed its
//! initial list.

mod callback;
mod node;
mod pods;

pub use callback::{CallbackRunner, RegisterType, StateSnapshot, UpdateCallback};
pub use node::{NodeInformer, NODE_INFORMER};
pub use pods::{PodsInformer, PODS_INFORMER};

use crate::config::StatesInformerConfig;
use crate::readiness::ReadyLatch;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use interfero::k8s::{Event, K8sClient, PodMeta, ResourceWatcher};
use k8s_openapi::api::core::v1::Node;
use kube::Resource;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
pub trait StatesInformer: Send + Sync {
    /// Start every sub-watcher and block until `stop` fires.
    ///
    /// Fails if the sub-watchers do not sync within the configured timeout.
    async fn run(&self, stop: CancellationToken) -> Result<()>;

    fn has_synced(&self) -> bool;

    /// Resolves once every sub-watcher has synced
    async fn wait_for_sync(&self);

    fn get_node(&self) -> Option<Arc<Node>>;

    fn get_all_pods(&self) -> Vec<Arc<PodMeta>>;

    fn register_callbacks(
        &self,
        kind: RegisterType,
        name: &str,
        description: &str,
        callback: UpdateCallback,
    );
}

/// The closed set of sub-watchers
#[derive(Clone)]
pub enum InformerPlugin {
    Node(Arc<NodeInformer>),
    Pods(Arc<PodsInformer>),
}

impl InformerPlugin {
    pub fn name(&self) -> &'static str {
        match self {
            InformerPlugin::Node(_) => NODE_INFORMER,
            InformerPlugin::Pods(_) => PODS_INFORMER,
        }
    }

    pub fn has_synced(&self) -> bool {
        match self {
            InformerPlugin::Node(n) => n.has_synced(),
            InformerPlugin::Pods(p) => p.has_synced(),
        }
    }

    fn synced(&self) -> &ReadyLatch {
        match self {
            InformerPlugin::Node(n) => n.synced(),
            InformerPlugin::Pods(p) => p.synced(),
        }
    }

    async fn start(self, k8s: K8sClient, callbacks: Arc<CallbackRunner>, stop: CancellationToken) {
        match self {
            InformerPlugin::Node(n) => n.start(k8s, callbacks, stop).await,
            InformerPlugin::Pods(p) => p.start(k8s, callbacks, stop).await,
        }
    }
}

/// States informer backed by API server watches
pub struct KubeStatesInformer {
    config: StatesInformerConfig,
    k8s: K8sClient,
    node: Arc<NodeInformer>,
    pods: Arc<PodsInformer>,
    callbacks: Arc<CallbackRunner>,
}

impl KubeStatesInformer {
    pub fn new(config: StatesInformerConfig, k8s: K8sClient, node_name: &str) -> Self {
        Self {
            config,
            k8s,
            node: Arc::new(NodeInformer::new(node_name)),
            pods: Arc::new(PodsInformer::new(node_name)),
            callbacks: Arc::new(CallbackRunner::new()),
        }
    }

    pub fn plugins(&self) -> [InformerPlugin; 2] {
        [
            InformerPlugin::Node(self.node.clone()),
            InformerPlugin::Pods(self.pods.clone()),
        ]
    }
}

#[async_trait]
impl StatesInformer for KubeStatesInformer {
    async fn run(&self, stop: CancellationToken) -> Result<()> {
        info!("Starting callback runner");
        {
            let runner = self.callbacks.clone();
            let node = self.node.clone();
            let pods = self.pods.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let snapshot = || StateSnapshot {
                    node: node.get_node(),
                    pods: pods.get_all_pods(),
                };
                runner.run(snapshot, stop).await
            });
        }

        for plugin in self.plugins() {
            info!("Starting informer plugin {}", plugin.name());
            tokio::spawn(plugin.start(self.k8s.clone(), self.callbacks.clone(), stop.clone()));
        }

        info!("Waiting for informer syncing");
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            synced = tokio::time::timeout(self.config.sync_timeout, self.wait_for_sync()) => {
                synced.map_err(|_| {
                    anyhow!("timed out waiting for states informer caches to sync")
                })?;
            }
        }

        info!("Started states informer successfully");
        stop.cancelled().await;
        info!("Shutting down states informer");
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.plugins().iter().all(InformerPlugin::has_synced)
    }

    async fn wait_for_sync(&self) {
        for plugin in self.plugins() {
            plugin.synced().wait().await;
        }
    }

    fn get_node(&self) -> Option<Arc<Node>> {
        self.node.get_node()
    }

    fn get_all_pods(&self) -> Vec<Arc<PodMeta>> {
        self.pods.get_all_pods()
    }

    fn register_callbacks(
        &self,
        kind: RegisterType,
        name: &str,
        description: &str,
        callback: UpdateCallback,
    ) {
        self.callbacks.register(kind, name, description, callback);
    }
}

/// Keep a watch running until `stop` fires, reconnecting with exponential
/// backoff when the stream fails. Every reconnect starts with a full relist.
pub(crate) async fn watch_with_backoff<K, H>(
    watcher: &ResourceWatcher<K>,
    stop: CancellationToken,
    mut handler: H,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    H: FnMut(Event<K>),
{
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let result = tokio::select! {
            _ = stop.cancelled() => return,
            result = watcher.watch(&mut handler) => result,
        };

        match result {
            Ok(()) => {
                warn!("{} watch stream ended, reconnecting", watcher.kind());
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                error!(
                    "{} watch failed: {}, reconnecting in {:?}",
                    watcher.kind(),
                    e,
                    backoff
                );
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use k8s_openapi::api::core::v1::Pod;

    fn informer() -> KubeStatesInformer {
        // Building a client does not contact the API server.
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        KubeStatesInformer::new(
            StatesInformerConfig::default(),
            K8sClient::from_client(client),
            "n1",
        )
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_has_synced_requires_every_plugin() {
        let informer = informer();
        let runner = CallbackRunner::new();
        assert!(!informer.has_synced());

        informer.node.handle_event(Event::InitApply(node("n1")), &runner);
        informer.node.handle_event(Event::InitDone, &runner);
        assert!(!informer.has_synced());
        assert!(!informer.has_synced());

        informer.pods.handle_event(Event::<Pod>::Init, &runner);
        informer.pods.handle_event(Event::<Pod>::InitDone, &runner);
        assert!(informer.has_synced());

        tokio::time::timeout(Duration::from_secs(1), informer.wait_for_sync())
            .await
            .unwrap();
        assert!(informer.get_node().is_some());
        assert!(informer.get_all_pods().is_empty());
    }

    #[tokio::test]
    async fn test_plugin_names() {
        let informer = informer();
        let names: Vec<_> = informer.plugins().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec![NODE_INFORMER, PODS_INFORMER]);
    }
}
