//! Shared definitions between the scheduler tracing program (kernel) and userspace
//!
//! Both sides must agree on:
//! - the width of the cgroup name key stored in the per-cgroup tables
//! - the names of the tables and programs inside the object file
//!
//! The crate is `no_std` unless the `userspace` feature is enabled.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Width of the cgroup name key in bytes, including the trailing NUL.
///
/// Kernel names longer than this are truncated by `bpf_probe_read_kernel_str`.
pub const MAX_CGROUP_NAME_SIZE: usize = 128;

/// Raw cgroup name key as stored in the kernel tables (NUL padded).
pub type CgroupNameKey = [u8; MAX_CGROUP_NAME_SIZE];

/// Table names inside the tracing program object
pub mod maps {
    /// LRU hash: pid -> wake-up timestamp in nanoseconds
    pub const PID_START_TIME: &str = "PID_START_TIME";
    /// Hash: cgroup name -> cumulative wake-up to run delay in nanoseconds
    pub const OUTPUT_CGROUP_DELAY: &str = "OUTPUT_CGROUP_DELAY";
    /// Hash: cgroup name -> number of wake-up to run transitions
    pub const OUTPUT_CGROUP_COUNTER: &str = "OUTPUT_CGROUP_COUNTER";

    pub const PID_START_TIME_ENTRIES: u32 = 65536;
    pub const CGROUP_ENTRIES: u32 = 1024;
}

/// Program names inside the tracing program object
pub mod programs {
    pub const HANDLE_SCHED_WAKEUP: &str = "handle_sched_wakeup";
    pub const HANDLE_SCHED_WAKEUP_NEW: &str = "handle_sched_wakeup_new";
    pub const HANDLE_SCHED_SWITCH: &str = "handle_sched_switch";
}

/// Field offsets in the `sched` tracepoint records (see
/// `/sys/kernel/tracing/events/sched/<event>/format`).
pub mod tracepoint_offsets {
    /// `long prev_state` in `sched_switch`
    pub const SWITCH_PREV_STATE: usize = 32;
    /// `pid_t next_pid` in `sched_switch`
    pub const SWITCH_NEXT_PID: usize = 56;
}

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<CgroupNameKey>() == 128,
        "CgroupNameKey must be exactly 128 bytes"
    );
};
