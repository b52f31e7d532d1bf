//! Per-container CPU schedule latency
//!
//! Each cycle maps every live container to its cgroup name, traces the
//! scheduler for one time window and publishes the average wake-up to run
//! delay of every container the kernel reported on.

use super::framework::{Collector, Options};
use crate::cgroup::CgroupPathFormatter;
use crate::config::Feature;
use crate::readiness::ReadyLatch;
use crate::states_informer::StatesInformer;
use crate::trace::SessionOpener;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use interfero::k8s::ContainerCgroupInfo;
use interfero::metrics::AgentMetrics;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const COLLECTOR_NAME: &str = "CPUScheduleLatencyCollector";

pub fn new(options: &Options) -> Arc<dyn Collector> {
    Arc::new(CslCollector::from_options(options))
}

pub struct CslCollector {
    enabled: bool,
    interval: Duration,
    time_window: Duration,
    started: ReadyLatch,
    states_informer: Arc<dyn StatesInformer>,
    formatter: CgroupPathFormatter,
    metrics: Arc<AgentMetrics>,
    opener: Arc<dyn SessionOpener>,
}

impl CslCollector {
    pub fn from_options(options: &Options) -> Self {
        Self {
            enabled: options.feature_gates.enabled(Feature::CslCollector),
            interval: options.config.csl_interval(),
            time_window: options.config.csl_time_window(),
            started: ReadyLatch::new(),
            states_informer: options.states_informer.clone(),
            formatter: options.cgroup_formatter,
            metrics: options.metrics.clone(),
            opener: options.session_opener.clone(),
        }
    }

    /// Cgroup name of every container of every known pod
    fn container_cgroups(&self) -> HashMap<String, ContainerCgroupInfo> {
        let mut cgroups = HashMap::new();

        for meta in self.states_informer.get_all_pods() {
            for (container_name, container_id) in meta.running_containers() {
                match self.formatter.container_cgroup_name(container_id) {
                    Ok(name) => {
                        cgroups.insert(name, meta.container_info(container_name, container_id));
                    }
                    Err(e) => warn!(
                        "Failed to get cgroup name of container {} from pod {}/{}: {}",
                        container_name,
                        meta.namespace(),
                        meta.name(),
                        e
                    ),
                }
            }
        }

        cgroups
    }

    /// Run one full cycle, returning how many containers were published
    pub async fn collect(&self) -> Result<usize> {
        let begin = Instant::now();
        let containers = self.container_cgroups();
        let names: Vec<String> = containers.keys().cloned().collect();

        let btf = self
            .opener
            .btf_source()
            .context("Failed to detect kernel type metadata")?;
        let mut session = self
            .opener
            .open(&btf)
            .context("Failed to load scheduler latency program")?;

        // Not interruptible: the window is what the average is measured over.
        tokio::time::sleep(self.time_window).await;

        let averages = session.read_cgroup_averages(&names);
        let closed = session.close();
        let averages = averages.context("Failed to read container cpu schedule latency")?;
        closed.context("Failed to release scheduler latency program")?;

        let mut published = 0;
        for (name, latency) in averages {
            let Some(info) = containers.get(&name) else {
                debug!(
                    "CSL container info lost for cgroup {}, latency {}",
                    name, latency
                );
                continue;
            };
            match self.metrics.record_container_csl(info, latency) {
                Ok(()) => published += 1,
                Err(e) => error!("Failed to record latency of {}: {}", info.container_id, e),
            }
        }

        self.started.set();
        debug!(
            "CPU schedule latency cycle finished in {:?}, {} containers",
            begin.elapsed(),
            published
        );
        Ok(published)
    }
}

#[async_trait]
impl Collector for CslCollector {
    fn name(&self) -> &'static str {
        COLLECTOR_NAME
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn started(&self) -> bool {
        self.started.is_ready()
    }

    async fn run(&self, stop: CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = self.states_informer.wait_for_sync() => {}
        }

        if !self.enabled {
            return;
        }

        info!(
            "Collecting CPU schedule latency every {:?} over {:?} windows",
            self.interval, self.time_window
        );
        loop {
            if let Err(e) = self.collect().await {
                error!("CPU schedule latency cycle failed: {:#}", e);
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("{} stopped", COLLECTOR_NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupDriver;
    use crate::config::{CollectorConfig, FeatureGates};
    use crate::metrics_advisor::testing::{FakeInformer, FakeOpener};
    use interfero::k8s::PodMeta;
    use interfero::metrics::exporter::format_metrics;
    use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
    use kube::api::ObjectMeta;
    use std::sync::atomic::Ordering;

    fn pod(name: &str, uid: &str, containers: &[(&str, &str)]) -> PodMeta {
        PodMeta::new(Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                uid: Some(uid.into()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|(n, id)| ContainerStatus {
                            name: n.to_string(),
                            container_id: Some(id.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        })
    }

    struct Harness {
        collector: CslCollector,
        opener: Arc<FakeOpener>,
        metrics: Arc<AgentMetrics>,
    }

    fn harness(pods: Vec<PodMeta>, opener: FakeOpener) -> Harness {
        let opener = Arc::new(opener);
        let metrics = Arc::new(AgentMetrics::new("n1").unwrap());
        let options = Options {
            config: Arc::new(CollectorConfig {
                csl_collector_time_window_seconds: 0,
                ..Default::default()
            }),
            feature_gates: FeatureGates::default().with(Feature::CslCollector, true),
            states_informer: Arc::new(FakeInformer::synced_with(pods)),
            metrics: metrics.clone(),
            cgroup_formatter: CgroupPathFormatter::new(CgroupDriver::Systemd).unwrap(),
            session_opener: opener.clone(),
        };
        Harness {
            collector: CslCollector::from_options(&options),
            opener,
            metrics,
        }
    }

    fn latency_lines(metrics: &AgentMetrics) -> Vec<String> {
        format_metrics(metrics.registry())
            .unwrap()
            .lines()
            .filter(|l| l.starts_with("interfero_container_cpu_schedule_latency{"))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_cycle_publishes_average() {
        let h = harness(
            vec![pod("p1", "uid-1", &[("c1", "containerd://c1")])],
            FakeOpener::with_rows(&[("cri-containerd-c1.scope", 1_000_000, 10)]),
        );

        assert!(!h.collector.started());
        assert_eq!(h.collector.collect().await.unwrap(), 1);
        assert!(h.collector.started());

        let lines = latency_lines(&h.metrics);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(r#"container_id="containerd://c1""#));
        assert!(lines[0].contains(r#"pod_name="p1""#));
        assert!(lines[0].ends_with(" 100000"));
        assert_eq!(h.opener.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_switches_publish_zero() {
        let h = harness(
            vec![pod("p1", "uid-1", &[("c1", "containerd://c1")])],
            FakeOpener::with_rows(&[("cri-containerd-c1.scope", 1_000_000, 0)]),
        );

        assert_eq!(h.collector.collect().await.unwrap(), 1);
        let lines = latency_lines(&h.metrics);
        assert!(lines[0].ends_with(" 0"));
    }

    #[tokio::test]
    async fn test_unknown_cgroup_skipped() {
        let h = harness(
            vec![pod(
                "p1",
                "uid-1",
                &[("c1", "containerd://c1"), ("c2", "docker://c2")],
            )],
            FakeOpener::with_rows(&[
                ("cri-containerd-c1.scope", 500, 5),
                ("orphan", 1_000, 1),
            ]),
        );

        assert_eq!(h.collector.collect().await.unwrap(), 2);
        let lines = latency_lines(&h.metrics);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| !l.contains("orphan")));
        assert!(lines
            .iter()
            .any(|l| l.contains(r#"container_id="docker://c2""#) && l.ends_with(" 0")));
    }

    #[tokio::test]
    async fn test_unsupported_container_id_skips_entry() {
        let h = harness(
            vec![pod(
                "p1",
                "uid-1",
                &[("c1", "containerd://c1"), ("bad", "rkt://x")],
            )],
            FakeOpener::with_rows(&[("cri-containerd-c1.scope", 100, 1)]),
        );

        assert_eq!(h.collector.collect().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_aborts_cycle_only() {
        let h = harness(
            vec![pod("p1", "uid-1", &[("c1", "containerd://c1")])],
            FakeOpener::with_rows(&[("cri-containerd-c1.scope", 100, 1)]),
        );
        h.opener.fail_open.store(true, Ordering::SeqCst);

        assert!(h.collector.collect().await.is_err());
        assert!(!h.collector.started());
        assert!(latency_lines(&h.metrics).is_empty());

        h.opener.fail_open.store(false, Ordering::SeqCst);
        assert_eq!(h.collector.collect().await.unwrap(), 1);
        assert!(h.collector.started());
    }

    #[tokio::test]
    async fn test_run_latches_and_stops() {
        let h = Arc::new(harness(
            vec![pod("p1", "uid-1", &[("c1", "containerd://c1")])],
            FakeOpener::with_rows(&[("cri-containerd-c1.scope", 100, 1)]),
        ));
        let stop = CancellationToken::new();
        let task = {
            let h = h.clone();
            let stop = stop.clone();
            tokio::spawn(async move { h.collector.run(stop).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.collector.started() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.opener.opens.load(Ordering::SeqCst), 1);
    }
}
