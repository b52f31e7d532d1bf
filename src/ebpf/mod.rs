pub mod loader;
pub mod maps;

pub use loader::{BtfSource, DEFAULT_BTF_DIR, VMLINUX_BTF_PATH};
pub use maps::{CgroupLatencyReader, CgroupSchedStats};

use interfero_common::programs;

/// Scheduler tracepoints the latency program attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tracepoint {
    SchedWakeup,
    SchedWakeupNew,
    SchedSwitch,
}

impl Tracepoint {
    pub const ALL: [Tracepoint; 3] = [
        Tracepoint::SchedWakeup,
        Tracepoint::SchedWakeupNew,
        Tracepoint::SchedSwitch,
    ];

    pub const fn category(&self) -> &'static str {
        "sched"
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Tracepoint::SchedWakeup => "sched_wakeup",
            Tracepoint::SchedWakeupNew => "sched_wakeup_new",
            Tracepoint::SchedSwitch => "sched_switch",
        }
    }

    /// Name of the program handling this tracepoint in the object file
    pub const fn program(&self) -> &'static str {
        match self {
            Tracepoint::SchedWakeup => programs::HANDLE_SCHED_WAKEUP,
            Tracepoint::SchedWakeupNew => programs::HANDLE_SCHED_WAKEUP_NEW,
            Tracepoint::SchedSwitch => programs::HANDLE_SCHED_SWITCH,
        }
    }
}

impl std::fmt::Display for Tracepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.category(), self.as_str())
    }
}
