//! Daemon wiring: states informer first, then the metric advisor

use crate::cgroup::CgroupPathFormatter;
use crate::cgroup_driver::{CgroupDriverResolver, DriverFallback, KubeletConfigz};
use crate::config::Configuration;
use crate::metrics_advisor::{MetricAdvisor, Options};
use crate::readiness::ReadyLatch;
use crate::states_informer::{KubeStatesInformer, StatesInformer};
use crate::trace::SessionOpener;
use anyhow::{anyhow, bail, Context, Result};
use interfero::k8s::K8sClient;
use interfero::metrics::AgentMetrics;
use log::info;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ADVISOR_SYNC_POLL: Duration = Duration::from_millis(100);

pub struct Daemon {
    metrics: Arc<AgentMetrics>,
    states_informer: Arc<dyn StatesInformer>,
    advisor: Arc<MetricAdvisor>,
    ready: ReadyLatch,
}

impl Daemon {
    pub async fn new(
        config: Arc<Configuration>,
        metrics: Arc<AgentMetrics>,
        session_opener: Arc<dyn SessionOpener>,
    ) -> Result<Self> {
        let node_name = config.node_name.as_str();
        if node_name.is_empty() {
            bail!("failed to create daemon: NODE_NAME env is empty");
        }

        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as f64)
            .unwrap_or_default();
        info!("NODE_NAME is {}, start time {}", node_name, start_time);
        metrics.record_start_time(start_time);

        let k8s = K8sClient::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        let states_informer: Arc<dyn StatesInformer> = Arc::new(KubeStatesInformer::new(
            config.states_informer.clone(),
            k8s.clone(),
            node_name,
        ));

        let fallback = KubeletConfigz::new(k8s, node_name)?;
        let resolver = CgroupDriverResolver::new(&config.cgroup_root_dir, fallback);

        Self::with_resolver(config, metrics, session_opener, states_informer, resolver).await
    }

    /// Resolves the cgroup driver before any collector is built; a
    /// resolution failure is fatal.
    pub async fn with_resolver<F: DriverFallback>(
        config: Arc<Configuration>,
        metrics: Arc<AgentMetrics>,
        session_opener: Arc<dyn SessionOpener>,
        states_informer: Arc<dyn StatesInformer>,
        resolver: CgroupDriverResolver<F>,
    ) -> Result<Self> {
        let driver = resolver
            .resolve()
            .await
            .context("Failed to resolve cgroup driver")?;
        let cgroup_formatter = CgroupPathFormatter::new(driver)?;
        info!("Node {} uses '{}' as cgroup driver", config.node_name, driver);

        let advisor = MetricAdvisor::new(Options {
            config: Arc::new(config.collector.clone()),
            feature_gates: config.feature_gates.clone(),
            states_informer: states_informer.clone(),
            metrics: metrics.clone(),
            cgroup_formatter,
            session_opener,
        });

        Ok(Self::from_parts(metrics, states_informer, advisor))
    }

    pub fn from_parts(
        metrics: Arc<AgentMetrics>,
        states_informer: Arc<dyn StatesInformer>,
        advisor: MetricAdvisor,
    ) -> Self {
        Self {
            metrics,
            states_informer,
            advisor: Arc::new(advisor),
            ready: ReadyLatch::new(),
        }
    }

    /// Set once the informer and every enabled collector have synced
    pub fn ready(&self) -> ReadyLatch {
        self.ready.clone()
    }

    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        info!("Starting daemon");

        let mut informer_task: JoinHandle<Result<()>> = {
            let informer = self.states_informer.clone();
            let stop = stop.clone();
            tokio::spawn(async move { informer.run(stop).await })
        };

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            result = &mut informer_task => {
                return Err(exited("states informer", result));
            }
            _ = self.states_informer.wait_for_sync() => {}
        }

        {
            let sweeper = self.metrics.sweeper();
            let stop = stop.clone();
            tokio::spawn(async move { sweeper.run(stop.cancelled()).await });
        }

        let mut advisor_task: JoinHandle<Result<()>> = {
            let advisor = self.advisor.clone();
            let stop = stop.clone();
            tokio::spawn(async move { advisor.run(stop).await })
        };

        let mut advisor_done = false;
        while !self.advisor.has_synced() {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                result = &mut informer_task => {
                    return Err(exited("states informer", result));
                }
                result = &mut advisor_task, if !advisor_done => {
                    advisor_done = true;
                    match result {
                        Ok(Ok(())) => {}
                        other => return Err(exited("metric advisor", other)),
                    }
                }
                _ = tokio::time::sleep(ADVISOR_SYNC_POLL) => {}
            }
        }

        self.ready.set();
        info!("Started daemon successfully");

        tokio::select! {
            _ = stop.cancelled() => {}
            result = &mut informer_task => {
                return Err(exited("states informer", result));
            }
        }
        info!("Shutting down daemon");
        Ok(())
    }
}

fn exited(task: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow!("{} exited unexpectedly", task),
        Ok(Err(e)) => e.context(format!("Unable to run the {}", task)),
        Err(e) => anyhow!("{} task panicked: {}", task, e),
    }
}
