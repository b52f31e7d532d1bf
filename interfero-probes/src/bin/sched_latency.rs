//! Wake-up to run latency per cgroup
//!
//! A wake-up (or an involuntary switch out) stamps the time for a pid. When
//! that pid is switched in, the elapsed time is added to the table entry of
//! the cgroup running the switch, and the entry's counter is bumped.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_task, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_kernel_str_bytes,
    },
    macros::{map, tracepoint},
    maps::{HashMap, LruHashMap},
    programs::TracePointContext,
};
use core::ptr::addr_of;
use interfero_common::{
    maps::{CGROUP_ENTRIES, PID_START_TIME_ENTRIES},
    tracepoint_offsets::{SWITCH_NEXT_PID, SWITCH_PREV_STATE},
    CgroupNameKey, MAX_CGROUP_NAME_SIZE,
};
use interfero_probes::vmlinux::{cgroup, cgroup_subsys_state, css_set, kernfs_node, task_struct};

const TASK_RUNNING: i64 = 0;

/// Index of the cpu controller in `css_set::subsys`
const CPU_CGROUP_SUBSYS: usize = 1;

#[map(name = "PID_START_TIME")]
static PID_START_TIME: LruHashMap<u32, u64> =
    LruHashMap::with_max_entries(PID_START_TIME_ENTRIES, 0);

#[map(name = "OUTPUT_CGROUP_DELAY")]
static OUTPUT_CGROUP_DELAY: HashMap<CgroupNameKey, u64> =
    HashMap::with_max_entries(CGROUP_ENTRIES, 0);

#[map(name = "OUTPUT_CGROUP_COUNTER")]
static OUTPUT_CGROUP_COUNTER: HashMap<CgroupNameKey, u64> =
    HashMap::with_max_entries(CGROUP_ENTRIES, 0);

#[inline(always)]
fn current_task() -> *const task_struct {
    unsafe { bpf_get_current_task() as *const task_struct }
}

/// Record the enqueue timestamp of the task's thread group
#[inline(always)]
fn trace_enqueue(task: *const task_struct) -> Result<(), i64> {
    let ts = unsafe { bpf_ktime_get_ns() };
    let tgid: i32 = unsafe { bpf_probe_read_kernel(addr_of!((*task).tgid))? };
    PID_START_TIME.insert(&(tgid as u32), &ts, 0)
}

/// Copy the cpu cgroup directory name of `task` into `key`
#[inline(always)]
fn cgroup_name(task: *const task_struct, key: &mut CgroupNameKey) -> Result<(), i64> {
    unsafe {
        let cgroups: *mut css_set = bpf_probe_read_kernel(addr_of!((*task).cgroups))?;
        let css: *mut cgroup_subsys_state =
            bpf_probe_read_kernel(addr_of!((*cgroups).subsys[CPU_CGROUP_SUBSYS]))?;
        let cg: *mut cgroup = bpf_probe_read_kernel(addr_of!((*css).cgroup))?;
        let kn: *mut kernfs_node = bpf_probe_read_kernel(addr_of!((*cg).kn))?;
        let name = bpf_probe_read_kernel(addr_of!((*kn).name))? as *const u8;
        if name.is_null() {
            return Err(0);
        }
        bpf_probe_read_kernel_str_bytes(name, &mut key[..MAX_CGROUP_NAME_SIZE])?;
    }
    Ok(())
}

#[tracepoint(category = "sched", name = "sched_wakeup")]
pub fn handle_sched_wakeup(_ctx: TracePointContext) -> u32 {
    let _ = trace_enqueue(current_task());
    0
}

#[tracepoint(category = "sched", name = "sched_wakeup_new")]
pub fn handle_sched_wakeup_new(_ctx: TracePointContext) -> u32 {
    let _ = trace_enqueue(current_task());
    0
}

#[tracepoint(category = "sched", name = "sched_switch")]
pub fn handle_sched_switch(ctx: TracePointContext) -> u32 {
    let _ = try_sched_switch(&ctx);
    0
}

fn try_sched_switch(ctx: &TracePointContext) -> Result<(), i64> {
    let task = current_task();
    let mut key: CgroupNameKey = [0; MAX_CGROUP_NAME_SIZE];
    cgroup_name(task, &mut key)?;

    let next_pid: i32 = unsafe { ctx.read_at(SWITCH_NEXT_PID)? };
    let prev_state: i64 = unsafe { ctx.read_at(SWITCH_PREV_STATE)? };

    // Preempted while runnable: it is waiting again from now on.
    if prev_state == TASK_RUNNING {
        let _ = trace_enqueue(task);
    }

    let pid = next_pid as u32;
    let Some(start) = (unsafe { PID_START_TIME.get(&pid) }).copied() else {
        // missed enqueue
        return Ok(());
    };
    let delta = unsafe { bpf_ktime_get_ns() }.wrapping_sub(start);

    let count = unsafe { OUTPUT_CGROUP_COUNTER.get(&key) }.copied().unwrap_or(0);
    let delay = unsafe { OUTPUT_CGROUP_DELAY.get(&key) }.copied().unwrap_or(0);
    OUTPUT_CGROUP_COUNTER.insert(&key, &(count + 1), 0)?;
    OUTPUT_CGROUP_DELAY.insert(&key, &(delay + delta), 0)?;
    PID_START_TIME.remove(&pid)?;

    Ok(())
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
