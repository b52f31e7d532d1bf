use super::callback::{CallbackRunner, RegisterType};
use super::watch_with_backoff;
use crate::readiness::ReadyLatch;
use interfero::k8s::{pods_on_node_field_selector, Event, K8sClient, PodMeta, ResourceWatcher};
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

pub const PODS_INFORMER: &str = "podsInformer";

/// Watches the pods scheduled to the local node, keyed by pod UID
pub struct PodsInformer {
    node_name: String,
    // Replaced under a single write when a list completes.
    pods: RwLock<HashMap<String, Arc<PodMeta>>>,
    // Pods of a list in progress
    relist: Mutex<Option<HashMap<String, Arc<PodMeta>>>>,
    synced: ReadyLatch,
}

fn pod_key(pod: &Pod) -> String {
    match pod.metadata.uid.as_deref() {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        ),
    }
}

impl PodsInformer {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            pods: RwLock::new(HashMap::new()),
            relist: Mutex::new(None),
            synced: ReadyLatch::new(),
        }
    }

    pub fn get_all_pods(&self) -> Vec<Arc<PodMeta>> {
        self.pods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn pods_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<PodMeta>>> {
        self.pods.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_synced(&self) -> bool {
        self.synced.is_ready()
    }

    pub fn synced(&self) -> &ReadyLatch {
        &self.synced
    }

    pub fn handle_event(&self, event: Event<Pod>, callbacks: &CallbackRunner) {
        match event {
            Event::Init => {
                debug!("Listing pods on node {}", self.node_name);
                *self.relist.lock().unwrap_or_else(PoisonError::into_inner) = Some(HashMap::new());
            }
            Event::InitApply(pod) => {
                let mut relist = self.relist.lock().unwrap_or_else(PoisonError::into_inner);
                let pending = relist.get_or_insert_with(HashMap::new);
                pending.insert(pod_key(&pod), Arc::new(PodMeta::new(pod)));
            }
            Event::InitDone => {
                let listed = self
                    .relist
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_default();
                let count = listed.len();
                *self.pods_mut() = listed;
                if !self.synced.is_ready() {
                    info!(
                        "Pods informer synced, {} pods on node {}",
                        count, self.node_name
                    );
                }
                self.synced.set();
                callbacks.send_update(RegisterType::AllPods);
            }
            Event::Apply(pod) => {
                self.pods_mut()
                    .insert(pod_key(&pod), Arc::new(PodMeta::new(pod)));
                callbacks.send_update(RegisterType::AllPods);
            }
            Event::Delete(pod) => {
                let removed = self.pods_mut().remove(&pod_key(&pod));
                if removed.is_some() {
                    debug!(
                        "Removed pod {}/{}",
                        pod.metadata.namespace.as_deref().unwrap_or_default(),
                        pod.metadata.name.as_deref().unwrap_or_default()
                    );
                }
                callbacks.send_update(RegisterType::AllPods);
            }
        }
    }

    pub async fn start(
        self: Arc<Self>,
        k8s: K8sClient,
        callbacks: Arc<CallbackRunner>,
        stop: CancellationToken,
    ) {
        let watcher = ResourceWatcher::new(k8s.pods_all(), "pod")
            .with_fields(&pods_on_node_field_selector(&self.node_name));
        watch_with_backoff(&watcher, stop, |event| {
            self.handle_event(event, &callbacks)
        })
        .await;
    }
}
