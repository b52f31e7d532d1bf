//! Shared building blocks of the interfero node agent
//!
//! - `ebpf`: kernel type metadata detection and aggregation of the scheduler tables
//! - `k8s`: client helpers, resource watchers and pod/container types
//! - `metrics`: expiring gauges, agent metrics and the Prometheus exporter

pub mod ebpf;
pub mod error;
pub mod k8s;
pub mod metrics;

pub use error::{InterferoError, MultiError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
