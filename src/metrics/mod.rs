pub mod agent;
pub mod exporter;
pub mod expiring;

pub use agent::AgentMetrics;
pub use exporter::PrometheusExporter;
pub use expiring::{ExpireSweeper, ExpiringGaugeVec};
