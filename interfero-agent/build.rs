use anyhow::{bail, Context};
use std::env;
use std::path::PathBuf;

const PROBE_PACKAGE: &str = "interfero-probes";
const PROBE_OBJECT: &str = "sched_latency";

fn main() -> anyhow::Result<()> {
    println!("cargo:rustc-check-cfg=cfg(embedded_probe)");
    println!("cargo:rerun-if-env-changed=INTERFERO_BUILD_EBPF");

    // Nothing to embed when this crate itself targets bpf or a non-Linux host.
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default() == "bpf" {
        return Ok(());
    }
    if env::consts::OS != "linux" {
        println!(
            "cargo:warning=scheduler probe not built on {}; the agent only runs on Linux",
            env::consts::OS
        );
        return Ok(());
    }

    // Needs bpf-linker and a nightly toolchain. Without it the agent reads
    // the object from --probe-path at runtime.
    if env::var_os("INTERFERO_BUILD_EBPF").is_none() {
        return Ok(());
    }

    // The probe crate sits outside the workspace, so ask it directly.
    let manifest = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?)
        .join("..")
        .join(PROBE_PACKAGE)
        .join("Cargo.toml");
    println!("cargo:rerun-if-changed={}", manifest.display());
    println!("cargo:rerun-if-changed=../{}/src", PROBE_PACKAGE);

    let metadata = aya_build::cargo_metadata::MetadataCommand::new()
        .manifest_path(&manifest)
        .no_deps()
        .exec()
        .context("cargo metadata")?;
    let Some(probes) = metadata
        .packages
        .into_iter()
        .find(|pkg| pkg.name == PROBE_PACKAGE)
    else {
        bail!("{} package not found", PROBE_PACKAGE);
    };

    aya_build::build_ebpf([probes])?;

    let object = PathBuf::from(env::var("OUT_DIR")?).join(PROBE_OBJECT);
    if !object.exists() {
        bail!("{} was not produced by the probe build", object.display());
    }

    println!("cargo:rustc-cfg=embedded_probe");
    Ok(())
}
