//! Aggregation of the per-cgroup scheduling tables
//!
//! The kernel program keeps two hash tables keyed by the raw cgroup name:
//! cumulative wake-up to run delay, and the number of such transitions.
//! Keyed lookups with variable-length byte-array keys are unreliable, so the
//! tables are always walked in full and filtered against the cgroups we care about.

use std::collections::HashMap;

/// Delay and switch count observed for one cgroup during a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupSchedStats {
    pub delay_ns: u64,
    pub switches: u64,
}

impl CgroupSchedStats {
    /// Average delay per switch in nanoseconds, 0.0 when nothing was switched in
    pub fn average(&self) -> f64 {
        if self.switches == 0 {
            0.0
        } else {
            self.delay_ns as f64 / self.switches as f64
        }
    }
}

/// Convert a NUL-padded kernel key into a cgroup name
pub fn cgroup_name_from_key(key: &[u8]) -> String {
    let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
    String::from_utf8_lossy(&key[..end]).into_owned()
}

/// Streaming reader fed with the entries of both tables.
///
/// Every requested name is present in the result, zero-valued when the kernel
/// never recorded it.
pub struct CgroupLatencyReader {
    stats: HashMap<String, Option<CgroupSchedStats>>,
}

impl CgroupLatencyReader {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            stats: names
                .iter()
                .map(|n| (n.as_ref().to_string(), None))
                .collect(),
        }
    }

    /// Feed one entry of the delay table
    pub fn observe_delay(&mut self, key: &[u8], delay_ns: u64) {
        let name = cgroup_name_from_key(key);
        if let Some(slot) = self.stats.get_mut(&name) {
            *slot = Some(CgroupSchedStats {
                delay_ns,
                switches: 0,
            });
        }
    }

    /// Feed one entry of the counter table.
    ///
    /// Counters for cgroups absent from the delay table are ignored; their
    /// average stays 0.
    pub fn observe_switches(&mut self, key: &[u8], switches: u64) {
        let name = cgroup_name_from_key(key);
        if let Some(Some(stats)) = self.stats.get_mut(&name) {
            stats.switches = switches;
        }
    }

    /// Average latency per requested cgroup name
    pub fn averages(&self) -> HashMap<String, f64> {
        self.stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.map(|s| s.average()).unwrap_or(0.0)))
            .collect()
    }
}
