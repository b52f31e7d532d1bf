use crate::k8s::ContainerCgroupInfo;
use crate::metrics::expiring::{
    ExpireSweeper, ExpiringGaugeVec, DEFAULT_EXPIRE_RATIO, DEFAULT_SWEEP_INTERVAL,
};
use crate::Result;
use prometheus::{GaugeVec, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;

pub const SUBSYSTEM: &str = "interfero";

pub const NODE_KEY: &str = "node";
pub const CONTAINER_ID: &str = "container_id";
pub const CONTAINER_NAME: &str = "container_name";
pub const POD_UID: &str = "pod_uid";
pub const POD_NAME: &str = "pod_name";
pub const POD_NAMESPACE: &str = "pod_namespace";

/// Metrics exported by the node agent
pub struct AgentMetrics {
    registry: Registry,
    node_name: String,
    start_time: GaugeVec,
    container_csl: Arc<ExpiringGaugeVec>,
    sweep_interval: Duration,
}

impl AgentMetrics {
    pub fn new(node_name: &str) -> Result<Self> {
        Self::with_sweep_interval(node_name, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(node_name: &str, sweep_interval: Duration) -> Result<Self> {
        let registry = Registry::new();

        let start_time = GaugeVec::new(
            Opts::new("start_time", "Unix time the agent process started")
                .subsystem(SUBSYSTEM),
            &[NODE_KEY],
        )?;

        let container_csl = Arc::new(ExpiringGaugeVec::new(
            Opts::new(
                "container_cpu_schedule_latency",
                "Average container CPU schedule latency in nanoseconds per switch",
            )
            .subsystem(SUBSYSTEM),
            &[
                NODE_KEY,
                CONTAINER_ID,
                CONTAINER_NAME,
                POD_UID,
                POD_NAME,
                POD_NAMESPACE,
            ],
            sweep_interval * DEFAULT_EXPIRE_RATIO,
        )?);

        registry.register(Box::new(start_time.clone()))?;
        registry.register(Box::new(container_csl.gauge_vec().clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            node_name: node_name.to_string(),
            start_time,
            container_csl,
            sweep_interval,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_start_time(&self, unix_seconds: f64) {
        self.start_time
            .with_label_values(&[self.node_name.as_str()])
            .set(unix_seconds);
    }

    pub fn record_container_csl(&self, info: &ContainerCgroupInfo, latency_ns: f64) -> Result<()> {
        self.container_csl.set(
            &[
                self.node_name.as_str(),
                info.container_id.as_str(),
                info.container_name.as_str(),
                info.pod_uid.as_str(),
                info.pod_name.as_str(),
                info.pod_namespace.as_str(),
            ],
            latency_ns,
        )
    }

    pub fn container_csl(&self) -> &ExpiringGaugeVec {
        &self.container_csl
    }

    /// Sweeper for every expiring metric of the agent
    pub fn sweeper(&self) -> ExpireSweeper {
        ExpireSweeper::new(vec![self.container_csl.clone()], self.sweep_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ContainerCgroupInfo {
        ContainerCgroupInfo {
            container_id: "containerd://c1".into(),
            container_name: "c1".into(),
            pod_uid: "uid-1".into(),
            pod_name: "p1".into(),
            pod_namespace: "default".into(),
        }
    }

    #[test]
    fn test_record_container_csl() {
        let metrics = AgentMetrics::new("n1").unwrap();
        metrics.record_container_csl(&info(), 100_000.0).unwrap();

        let text = crate::metrics::exporter::format_metrics(metrics.registry()).unwrap();
        let line = text
            .lines()
            .find(|l| l.starts_with("interfero_container_cpu_schedule_latency{"))
            .expect("latency sample exported");
        assert!(line.contains(r#"container_id="containerd://c1""#));
        assert!(line.contains(r#"node="n1""#));
        assert!(line.ends_with(" 100000"));
    }

    #[test]
    fn test_record_start_time() {
        let metrics = AgentMetrics::new("n1").unwrap();
        metrics.record_start_time(1_700_000_000.0);
        assert_eq!(
            metrics
                .start_time
                .with_label_values(&["n1"])
                .get(),
            1_700_000_000.0
        );
    }
}
