pub mod client;
pub mod types;
pub mod watcher;

pub use client::{kubelet_port, node_field_selector, pods_on_node_field_selector, K8sClient};
pub use types::{ContainerCgroupInfo, PodMeta};
pub use watcher::{Event, ResourceWatcher};
