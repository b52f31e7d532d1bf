use crate::cgroup::CgroupPathFormatter;
use crate::config::{CollectorConfig, FeatureGates};
use crate::states_informer::StatesInformer;
use crate::trace::SessionOpener;
use async_trait::async_trait;
use interfero::metrics::AgentMetrics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle every metric collector implements
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Static gate, fixed at construction
    fn enabled(&self) -> bool;

    /// One-time wiring before any collector runs
    fn setup(&self, _ctx: &Context) {}

    /// Latched once the first full collection cycle completed
    fn started(&self) -> bool;

    /// Owns the collection loop; returns after `stop` fires
    async fn run(&self, stop: CancellationToken);
}

/// Shared inputs handed to every collector constructor
#[derive(Clone)]
pub struct Options {
    pub config: Arc<CollectorConfig>,
    pub feature_gates: FeatureGates,
    pub states_informer: Arc<dyn StatesInformer>,
    pub metrics: Arc<AgentMetrics>,
    pub cgroup_formatter: CgroupPathFormatter,
    pub session_opener: Arc<dyn SessionOpener>,
}

pub type CollectorFactory = fn(&Options) -> Arc<dyn Collector>;

/// Every collector built by the advisor, in registration order
#[derive(Clone, Default)]
pub struct Context {
    pub collectors: Vec<(&'static str, Arc<dyn Collector>)>,
}

impl Context {
    pub fn collector(&self, name: &str) -> Option<&Arc<dyn Collector>> {
        self.collectors
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| c)
    }
}

/// Readiness over every enabled collector; disabled ones never block it
pub fn collectors_started(collectors: &[(&'static str, Arc<dyn Collector>)]) -> bool {
    collectors
        .iter()
        .filter(|(_, c)| c.enabled())
        .all(|(_, c)| c.started())
}
