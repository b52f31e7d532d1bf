use super::callback::{CallbackRunner, RegisterType};
use super::watch_with_backoff;
use crate::readiness::ReadyLatch;
use interfero::k8s::{node_field_selector, Event, K8sClient, ResourceWatcher};
use k8s_openapi::api::core::v1::Node;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const NODE_INFORMER: &str = "nodeInformer";

/// Watches the object of the local node
pub struct NodeInformer {
    node_name: String,
    node: watch::Sender<Option<Arc<Node>>>,
    // Whether the list in progress has returned the node
    listed: AtomicBool,
    synced: ReadyLatch,
}

impl NodeInformer {
    pub fn new(node_name: &str) -> Self {
        let (node, _) = watch::channel(None);
        Self {
            node_name: node_name.to_string(),
            node,
            listed: AtomicBool::new(false),
            synced: ReadyLatch::new(),
        }
    }

    pub fn get_node(&self) -> Option<Arc<Node>> {
        self.node.borrow().clone()
    }

    pub fn has_synced(&self) -> bool {
        self.synced.is_ready()
    }

    pub fn synced(&self) -> &ReadyLatch {
        &self.synced
    }

    pub fn handle_event(&self, event: Event<Node>, callbacks: &CallbackRunner) {
        match event {
            Event::Init => {
                debug!("Listing node {}", self.node_name);
                self.listed.store(false, Ordering::SeqCst);
            }
            Event::InitApply(node) => {
                if self.store(node) {
                    self.listed.store(true, Ordering::SeqCst);
                }
            }
            Event::InitDone => {
                if !self.listed.swap(false, Ordering::SeqCst)
                    && self.node.send_replace(None).is_some()
                {
                    warn!("Node {} missing from relist", self.node_name);
                }
                self.synced.set();
                callbacks.send_update(RegisterType::NodeUpdate);
            }
            Event::Apply(node) => {
                self.store(node);
                callbacks.send_update(RegisterType::NodeUpdate);
            }
            Event::Delete(_) => {
                warn!("Node {} was deleted", self.node_name);
                self.node.send_replace(None);
                callbacks.send_update(RegisterType::NodeUpdate);
            }
        }
    }

    /// Keep `node` if it is the watched one
    fn store(&self, node: Node) -> bool {
        if node.metadata.name.as_deref() != Some(self.node_name.as_str()) {
            debug!(
                "Ignoring node {:?}, watching {}",
                node.metadata.name, self.node_name
            );
            return false;
        }
        self.node.send_replace(Some(Arc::new(node)));
        true
    }

    pub async fn start(
        self: Arc<Self>,
        k8s: K8sClient,
        callbacks: Arc<CallbackRunner>,
        stop: CancellationToken,
    ) {
        let watcher = ResourceWatcher::new(k8s.nodes(), "node")
            .with_fields(&node_field_selector(&self.node_name));
        watch_with_backoff(&watcher, stop, |event| {
            self.handle_event(event, &callbacks)
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_synced_after_initial_list() {
        let informer = NodeInformer::new("n1");
        let callbacks = CallbackRunner::new();
        assert!(!informer.has_synced());

        informer.handle_event(Event::Init, &callbacks);
        informer.handle_event(Event::InitApply(node("n1")), &callbacks);
        assert!(!informer.has_synced());

        informer.handle_event(Event::InitDone, &callbacks);
        assert!(informer.has_synced());
        assert_eq!(
            informer.get_node().unwrap().metadata.name.as_deref(),
            Some("n1")
        );
    }

    #[test]
    fn test_other_nodes_ignored_and_delete_clears() {
        let informer = NodeInformer::new("n1");
        let callbacks = CallbackRunner::new();

        informer.handle_event(Event::Apply(node("n2")), &callbacks);
        assert!(informer.get_node().is_none());

        informer.handle_event(Event::Apply(node("n1")), &callbacks);
        assert!(informer.get_node().is_some());

        informer.handle_event(Event::Delete(node("n1")), &callbacks);
        assert!(informer.get_node().is_none());
    }

    #[test]
    fn test_relist_without_node_clears_it() {
        let informer = NodeInformer::new("n1");
        let callbacks = CallbackRunner::new();

        informer.handle_event(Event::Init, &callbacks);
        informer.handle_event(Event::InitApply(node("n1")), &callbacks);
        informer.handle_event(Event::InitDone, &callbacks);
        assert!(informer.get_node().is_some());

        informer.handle_event(Event::Init, &callbacks);
        informer.handle_event(Event::InitApply(node("n2")), &callbacks);
        informer.handle_event(Event::InitDone, &callbacks);
        assert!(informer.get_node().is_none());
        assert!(informer.has_synced());
    }

    #[test]
    fn test_relist_with_node_keeps_latest() {
        let informer = NodeInformer::new("n1");
        let callbacks = CallbackRunner::new();

        informer.handle_event(Event::Apply(node("n1")), &callbacks);
        let before = informer.get_node().unwrap();

        informer.handle_event(Event::Init, &callbacks);
        informer.handle_event(Event::InitApply(node("n1")), &callbacks);
        informer.handle_event(Event::InitDone, &callbacks);

        let after = informer.get_node().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
