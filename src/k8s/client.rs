use crate::{InterferoError, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};
use tracing::{debug, info};

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await.map_err(|e| {
            InterferoError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    pub fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes().get(name).await.map_err(|e| {
            if e.to_string().contains("NotFound") || e.to_string().contains("404") {
                InterferoError::NodeNotFound(name.to_string())
            } else {
                InterferoError::KubernetesError(format!("Failed to get node {}: {}", name, e))
            }
        })
    }
}

/// Field selector matching exactly one node object
pub fn node_field_selector(node_name: &str) -> String {
    format!("metadata.name={}", node_name)
}

/// Field selector matching the pods scheduled to a node
pub fn pods_on_node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={}", node_name)
}

/// Port the kubelet published in the node status, if any
pub fn kubelet_port(node: &Node) -> Option<u16> {
    node.status
        .as_ref()
        .and_then(|s| s.daemon_endpoints.as_ref())
        .and_then(|d| d.kubelet_endpoint.as_ref())
        .and_then(|e| u16::try_from(e.port).ok())
        .filter(|p| *p != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{DaemonEndpoint, NodeDaemonEndpoints, NodeStatus};

    #[test]
    fn test_field_selectors() {
        assert_eq!(node_field_selector("n1"), "metadata.name=n1");
        assert_eq!(pods_on_node_field_selector("n1"), "spec.nodeName=n1");
    }

    #[test]
    fn test_kubelet_port() {
        let mut node = Node::default();
        assert_eq!(kubelet_port(&node), None);

        node.status = Some(NodeStatus {
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint { port: 10250 }),
            }),
            ..Default::default()
        });
        assert_eq!(kubelet_port(&node), Some(10250));
    }
}
