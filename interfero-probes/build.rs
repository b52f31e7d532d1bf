use anyhow::{bail, Context};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

/// Kernel structs walked to find the cgroup name of the current task
const KERNEL_TYPES: &[&str] = &[
    "task_struct",
    "css_set",
    "cgroup_subsys_state",
    "cgroup",
    "kernfs_node",
];

fn main() -> anyhow::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=INTERFERO_VMLINUX_RS");

    let out = PathBuf::from(env::var("OUT_DIR")?).join("vmlinux.rs");

    // Pre-generated bindings, e.g. when building on a host without BTF
    if let Ok(path) = env::var("INTERFERO_VMLINUX_RS") {
        fs::copy(&path, &out).with_context(|| format!("copy {}", path))?;
        return Ok(());
    }

    let output = Command::new("aya-tool")
        .arg("generate")
        .args(KERNEL_TYPES)
        .output()
        .context("aya-tool not found; install it with `cargo install bindgen-cli aya-tool`")?;
    if !output.status.success() {
        bail!(
            "aya-tool generate failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fs::write(&out, output.stdout).context("write vmlinux.rs")?;
    Ok(())
}
