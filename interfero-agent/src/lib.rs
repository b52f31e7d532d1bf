//! Node agent for interfero (DaemonSet)
//!
//! Responsibilities:
//! - Resolve the node's cgroup driver and container cgroup names
//! - Keep a live view of the node and its pods
//! - Run metric collectors, tracing scheduler latency per container
//! - Publish per-container latency for Prometheus

pub mod cgroup;
pub mod cgroup_driver;
pub mod config;
pub mod daemon;
pub mod metrics_advisor;
pub mod readiness;
#[cfg(target_os = "linux")]
pub mod sched_latency;
pub mod states_informer;
pub mod trace;
