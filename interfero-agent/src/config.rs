//! Agent configuration
//!
//! Flags are parsed once at startup into an immutable [`Configuration`] that is
//! shared by reference with every component; there is no global mutable state.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use interfero::ebpf::DEFAULT_BTF_DIR;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PROBE_PATH: &str = "/usr/lib/interfero/probes/sched_latency";

#[derive(Parser, Debug, Clone)]
#[command(name = "interfero-agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-node CPU schedule latency agent for Kubernetes", long_about = None)]
pub struct Cli {
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, env = "NODE_NAME", help = "Name of the node this agent runs on")]
    pub node_name: Option<String>,

    #[arg(long, default_value = "0.0.0.0:9416", help = "Metrics listen address")]
    pub addr: SocketAddr,

    #[arg(
        long,
        default_value_t = 1,
        allow_negative_numbers = true,
        help = "Base collect interval in seconds, <= 0 disables every collector"
    )]
    pub collect_res_used_interval_seconds: i64,

    #[arg(long, default_value_t = 60, help = "Collect node cpu info interval in seconds")]
    pub collect_node_cpu_info_interval_seconds: i64,

    #[arg(
        long,
        default_value_t = 60,
        help = "Collect cpu schedule latency interval in seconds"
    )]
    pub cpu_schedule_latency_collector_interval_seconds: i64,

    #[arg(
        long,
        default_value_t = 10,
        help = "Collect cpu schedule latency time window in seconds"
    )]
    pub collect_cpu_schedule_latency_timewindow_seconds: i64,

    #[arg(
        long,
        default_value = "",
        help = "Comma separated Name=bool pairs for alpha/experimental features"
    )]
    pub feature_gates: String,

    #[arg(long, default_value = "/sys/fs/cgroup", help = "Root of the cgroup hierarchy")]
    pub cgroup_root_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_BTF_DIR, help = "Directory of vmlinux-<release> BTF files")]
    pub btf_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_PROBE_PATH, help = "Scheduler tracing program object")]
    pub probe_path: PathBuf,

    #[arg(long, default_value_t = 180, help = "States informer initial sync timeout in seconds")]
    pub states_informer_sync_timeout_seconds: u64,
}

/// Feature gates known to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Feature {
    /// Per-container CPU schedule latency collector
    CslCollector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreRelease {
    Alpha,
    Beta,
    Ga,
}

struct FeatureSpec {
    feature: Feature,
    default: bool,
    pre_release: PreRelease,
}

const KNOWN_FEATURES: &[FeatureSpec] = &[FeatureSpec {
    feature: Feature::CslCollector,
    default: false,
    pre_release: PreRelease::Alpha,
}];

impl Feature {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Feature::CslCollector => "CSLCollector",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        KNOWN_FEATURES
            .iter()
            .map(|s| s.feature)
            .find(|f| f.as_str() == name)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable set of feature gate values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGates {
    enabled: BTreeMap<Feature, bool>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            enabled: KNOWN_FEATURES
                .iter()
                .map(|s| (s.feature, s.default))
                .collect(),
        }
    }
}

impl FeatureGates {
    /// Parse `Name=bool,Name=bool`; unknown names are rejected
    pub fn parse(spec: &str) -> Result<Self> {
        let mut gates = Self::default();

        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("missing bool value for feature gate {:?}", pair))?;
            let feature = Feature::from_name(name.trim())
                .ok_or_else(|| anyhow!("unrecognized feature gate: {}", name.trim()))?;
            let value = parse_bool(value.trim())
                .ok_or_else(|| anyhow!("invalid value of {}={}", name.trim(), value.trim()))?;
            gates.enabled.insert(feature, value);
        }

        Ok(gates)
    }

    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.enabled.insert(feature, enabled);
        self
    }

    pub fn enabled(&self, feature: Feature) -> bool {
        self.enabled.get(&feature).copied().unwrap_or(false)
    }

    /// Help lines describing every known gate
    pub fn known_features() -> Vec<String> {
        KNOWN_FEATURES
            .iter()
            .map(|s| {
                format!(
                    "{}=true|false ({:?} - default={})",
                    s.feature, s.pre_release, s.default
                )
            })
            .collect()
    }
}

/// Boolean spellings accepted for a feature gate value
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Intervals of the metric advisor and its collectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    pub collect_res_used_interval_seconds: i64,
    pub collect_node_cpu_info_interval_seconds: i64,
    pub csl_collector_interval_seconds: i64,
    pub csl_collector_time_window_seconds: i64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collect_res_used_interval_seconds: 1,
            collect_node_cpu_info_interval_seconds: 60,
            csl_collector_interval_seconds: 60,
            csl_collector_time_window_seconds: 10,
        }
    }
}

impl CollectorConfig {
    /// The whole framework is off when the base interval is not positive
    pub fn collectors_enabled(&self) -> bool {
        self.collect_res_used_interval_seconds > 0
    }

    pub fn csl_interval(&self) -> Duration {
        seconds(self.csl_collector_interval_seconds)
    }

    pub fn csl_time_window(&self) -> Duration {
        seconds(self.csl_collector_time_window_seconds)
    }

}

fn seconds(s: i64) -> Duration {
    Duration::from_secs(s.max(0) as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatesInformerConfig {
    pub sync_timeout: Duration,
}

impl Default for StatesInformerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(180),
        }
    }
}

/// Everything the daemon needs, fixed at startup
#[derive(Debug, Clone)]
pub struct Configuration {
    pub node_name: String,
    pub addr: SocketAddr,
    pub feature_gates: FeatureGates,
    pub collector: CollectorConfig,
    pub states_informer: StatesInformerConfig,
    pub cgroup_root_dir: PathBuf,
    pub btf_dir: PathBuf,
    pub probe_path: PathBuf,
}

impl Configuration {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let node_name = cli
            .node_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow!("NODE_NAME env is empty"))?
            .to_string();

        let feature_gates = FeatureGates::parse(&cli.feature_gates).map_err(|e| {
            anyhow!(
                "unable to set up feature gates: {}. Known gates:\n{}",
                e,
                FeatureGates::known_features().join("\n")
            )
        })?;

        let collector = CollectorConfig {
            collect_res_used_interval_seconds: cli.collect_res_used_interval_seconds,
            collect_node_cpu_info_interval_seconds: cli.collect_node_cpu_info_interval_seconds,
            csl_collector_interval_seconds: cli.cpu_schedule_latency_collector_interval_seconds,
            csl_collector_time_window_seconds: cli.collect_cpu_schedule_latency_timewindow_seconds,
        };

        if collector.collectors_enabled() && feature_gates.enabled(Feature::CslCollector) {
            if collector.csl_collector_interval_seconds <= 0 {
                bail!("cpu-schedule-latency-collector-interval-seconds must be positive");
            }
            if collector.csl_collector_time_window_seconds < 0 {
                bail!("collect-cpu-schedule-latency-timewindow-seconds must not be negative");
            }
        }

        Ok(Self {
            node_name,
            addr: cli.addr,
            feature_gates,
            collector,
            states_informer: StatesInformerConfig {
                sync_timeout: Duration::from_secs(cli.states_informer_sync_timeout_seconds),
            },
            cgroup_root_dir: cli.cgroup_root_dir.clone(),
            btf_dir: cli.btf_dir.clone(),
            probe_path: cli.probe_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["interfero-agent"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_feature_gate_defaults() {
        let gates = FeatureGates::default();
        assert!(!gates.enabled(Feature::CslCollector));
    }

    #[test]
    fn test_feature_gate_parse() {
        let gates = FeatureGates::parse("CSLCollector=true").unwrap();
        assert!(gates.enabled(Feature::CslCollector));

        let gates = FeatureGates::parse(" CSLCollector = false , ").unwrap();
        assert!(!gates.enabled(Feature::CslCollector));
    }

    #[test]
    fn test_feature_gate_rejects_unknown_and_malformed() {
        assert!(FeatureGates::parse("Nope=true").is_err());
        assert!(FeatureGates::parse("CSLCollector").is_err());
        assert!(FeatureGates::parse("CSLCollector=yes").is_err());
        assert!(FeatureGates::parse("CSLCollector=").is_err());
    }

    #[test]
    fn test_feature_gate_bool_spellings() {
        let cases = [
            ("1", true),
            ("t", true),
            ("T", true),
            ("TRUE", true),
            ("true", true),
            ("True", true),
            ("0", false),
            ("f", false),
            ("F", false),
            ("FALSE", false),
            ("false", false),
            ("False", false),
        ];

        for (value, expected) in cases {
            let gates = FeatureGates::parse(&format!("CSLCollector={}", value))
                .unwrap_or_else(|e| panic!("{} rejected: {}", value, e));
            assert_eq!(gates.enabled(Feature::CslCollector), expected, "value {}", value);
        }
    }

    #[test]
    fn test_configuration_from_cli() {
        let cfg = Configuration::from_cli(&cli(&[
            "--node-name",
            "n1",
            "--feature-gates",
            "CSLCollector=true",
            "--collect-cpu-schedule-latency-timewindow-seconds",
            "5",
        ]))
        .unwrap();

        assert_eq!(cfg.node_name, "n1");
        assert!(cfg.feature_gates.enabled(Feature::CslCollector));
        assert_eq!(cfg.collector.csl_time_window(), Duration::from_secs(5));
        assert_eq!(cfg.collector.csl_interval(), Duration::from_secs(60));
        assert!(cfg.collector.collectors_enabled());
    }

    #[test]
    fn test_configuration_requires_node_name() {
        let mut c = cli(&[]);
        c.node_name = None;
        assert!(Configuration::from_cli(&c).is_err());

        c.node_name = Some("  ".into());
        assert!(Configuration::from_cli(&c).is_err());
    }

    #[test]
    fn test_non_positive_base_interval_disables_collectors() {
        let c = cli(&["--node-name", "n1", "--collect-res-used-interval-seconds", "-1"]);
        let cfg = Configuration::from_cli(&c).unwrap();
        assert!(!cfg.collector.collectors_enabled());
    }
}
