//! Collector framework
//!
//! Collectors are registered in a static table and constructed together with
//! shared [`Options`]. `run` starts every enabled collector as its own task.

pub mod csl_collector;
pub mod framework;

pub use framework::{Collector, CollectorFactory, Context, Options};

use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const COLLECTOR_PLUGINS: &[(&str, CollectorFactory)] =
    &[(csl_collector::COLLECTOR_NAME, csl_collector::new)];

pub struct MetricAdvisor {
    options: Options,
    context: Context,
}

impl MetricAdvisor {
    pub fn new(options: Options) -> Self {
        Self::with_plugins(options, COLLECTOR_PLUGINS)
    }

    pub fn with_plugins(options: Options, plugins: &[(&'static str, CollectorFactory)]) -> Self {
        let collectors = plugins
            .iter()
            .map(|(name, factory)| {
                info!("Creating collector {}", name);
                (*name, factory(&options))
            })
            .collect();

        Self {
            options,
            context: Context { collectors },
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn collectors_enabled(&self) -> bool {
        self.options.config.collectors_enabled()
    }

    /// True once every enabled collector completed a cycle, or when the
    /// framework is switched off entirely
    pub fn has_synced(&self) -> bool {
        !self.collectors_enabled() || framework::collectors_started(&self.context.collectors)
    }

    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        if !self.collectors_enabled() {
            info!(
                "collect-res-used-interval-seconds is {}, metric collector is disabled",
                self.options.config.collect_res_used_interval_seconds
            );
            return Ok(());
        }

        for (_, collector) in &self.context.collectors {
            collector.setup(&self.context);
        }

        info!("{} collectors in context", self.context.collectors.len());
        for (name, collector) in &self.context.collectors {
            if !collector.enabled() {
                debug!("Collector {} is not enabled, skip running", name);
                continue;
            }
            let collector = Arc::clone(collector);
            let stop = stop.clone();
            tokio::spawn(async move { collector.run(stop).await });
            info!("Collector {} started", name);
        }

        info!("Metric advisor started successfully");
        stop.cancelled().await;
        info!("Shutting down metric advisor");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators shared by the collector tests

    use crate::states_informer::{RegisterType, StatesInformer, UpdateCallback};
    use crate::trace::{SessionOpener, TraceSession};
    use anyhow::Result;
    use async_trait::async_trait;
    use interfero::ebpf::{BtfSource, CgroupLatencyReader};
    use interfero::k8s::PodMeta;
    use interfero::{InterferoError, Result as InterferoResult};
    use k8s_openapi::api::core::v1::Node;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    pub struct FakeInformer {
        pub pods: Mutex<Vec<Arc<PodMeta>>>,
        pub synced: AtomicBool,
    }

    impl FakeInformer {
        pub fn synced_with(pods: Vec<PodMeta>) -> Self {
            Self {
                pods: Mutex::new(pods.into_iter().map(Arc::new).collect()),
                synced: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl StatesInformer for FakeInformer {
        async fn run(&self, stop: CancellationToken) -> Result<()> {
            stop.cancelled().await;
            Ok(())
        }

        fn has_synced(&self) -> bool {
            self.synced.load(Ordering::SeqCst)
        }

        async fn wait_for_sync(&self) {
            while !self.has_synced() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }

        fn get_node(&self) -> Option<Arc<Node>> {
            None
        }

        fn get_all_pods(&self) -> Vec<Arc<PodMeta>> {
            self.pods.lock().unwrap().clone()
        }

        fn register_callbacks(&self, _: RegisterType, _: &str, _: &str, _: UpdateCallback) {}
    }

    /// Kernel tables as (name, delay, count) rows
    pub struct FakeSession {
        rows: Vec<(String, u64, u64)>,
        closes: Arc<AtomicUsize>,
        closed: bool,
    }

    impl TraceSession for FakeSession {
        fn read_cgroup_averages(&mut self, names: &[String]) -> InterferoResult<HashMap<String, f64>> {
            let mut reader = CgroupLatencyReader::new(names);
            for (name, delay, _) in &self.rows {
                reader.observe_delay(name.as_bytes(), *delay);
            }
            for (name, _, count) in &self.rows {
                reader.observe_switches(name.as_bytes(), *count);
            }
            Ok(reader.averages())
        }

        fn close(&mut self) -> InterferoResult<()> {
            if !self.closed {
                self.closed = true;
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeOpener {
        pub rows: Mutex<Vec<(String, u64, u64)>>,
        pub fail_open: AtomicBool,
        pub opens: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
    }

    impl FakeOpener {
        pub fn with_rows(rows: &[(&str, u64, u64)]) -> Self {
            let opener = Self::default();
            *opener.rows.lock().unwrap() = rows
                .iter()
                .map(|(n, d, c)| (n.to_string(), *d, *c))
                .collect();
            opener
        }
    }

    impl SessionOpener for FakeOpener {
        fn btf_source(&self) -> InterferoResult<BtfSource> {
            Ok(BtfSource::Embedded)
        }

        fn open(&self, _: &BtfSource) -> InterferoResult<Box<dyn TraceSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(InterferoError::AttachFailed("sched/sched_switch".into()));
            }
            Ok(Box::new(FakeSession {
                rows: self.rows.lock().unwrap().clone(),
                closes: self.closes.clone(),
                closed: false,
            }))
        }
    }
}
