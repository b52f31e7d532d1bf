use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// A pod scheduled to the local node, as last observed.
///
/// Shared behind `Arc` by the states informer; never mutated once handed out.
#[derive(Debug, Clone)]
pub struct PodMeta {
    pub pod: Pod,
}

impl PodMeta {
    pub fn new(pod: Pod) -> Self {
        Self { pod }
    }

    pub fn uid(&self) -> &str {
        self.pod.metadata.uid.as_deref().unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> &str {
        self.pod.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// (container name, container id) for every container with a runtime id
    pub fn running_containers(&self) -> Vec<(&str, &str)> {
        self.pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .filter_map(|cs| {
                        cs.container_id
                            .as_deref()
                            .filter(|id| !id.is_empty())
                            .map(|id| (cs.name.as_str(), id))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Identity labels for one of this pod's containers
    pub fn container_info(&self, container_name: &str, container_id: &str) -> ContainerCgroupInfo {
        ContainerCgroupInfo {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            pod_uid: self.uid().to_string(),
            pod_name: self.name().to_string(),
            pod_namespace: self.namespace().to_string(),
        }
    }
}

/// Identity of a container whose cgroup is traced during one collection cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCgroupInfo {
    pub container_id: String,
    pub container_name: String,
    pub pod_uid: String,
    pub pod_name: String,
    pub pod_namespace: String,
}
