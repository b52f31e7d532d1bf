//! Kernel side of interfero
//!
//! The tracing program lives in src/bin/sched_latency.rs. This library only
//! carries the kernel struct bindings generated at build time.

#![cfg_attr(not(test), no_std)]

#[allow(
    non_upper_case_globals,
    non_snake_case,
    non_camel_case_types,
    dead_code,
    clippy::all
)]
pub mod vmlinux {
    include!(concat!(env!("OUT_DIR"), "/vmlinux.rs"));
}

#[cfg(not(test))]
#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
