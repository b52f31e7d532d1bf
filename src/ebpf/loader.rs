use crate::{InterferoError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Kernel type metadata exported by kernels built with CONFIG_DEBUG_INFO_BTF
pub const VMLINUX_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// Where external `vmlinux-<release>` type descriptions are looked up by default
pub const DEFAULT_BTF_DIR: &str = "/usr/lib/interfero/btf";

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Source of kernel type metadata used to relocate the tracing program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtfSource {
    /// The running kernel exposes its own type metadata
    Embedded,
    /// A raw BTF file matching the running kernel release
    External { path: PathBuf, release: String },
}

impl BtfSource {
    /// Pick the metadata source for the running kernel
    pub fn detect(btf_dir: &Path) -> Result<Self> {
        Self::detect_with(Path::new(VMLINUX_BTF_PATH), btf_dir, kernel_release)
    }

    pub fn detect_with<F>(vmlinux: &Path, btf_dir: &Path, release: F) -> Result<Self>
    where
        F: FnOnce() -> Result<String>,
    {
        if path_exists(vmlinux)? {
            debug!("Kernel BTF available at {}", vmlinux.display());
            return Ok(BtfSource::Embedded);
        }

        let release = release()?;
        let path = btf_dir.join(format!("vmlinux-{}", release));
        info!(
            "Kernel BTF not found at {}, using external type description {}",
            vmlinux.display(),
            path.display()
        );
        Ok(BtfSource::External { path, release })
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, BtfSource::Embedded)
    }
}

/// Release string of the running kernel, e.g. `5.10.134-13.al8.x86_64`
pub fn kernel_release() -> Result<String> {
    let release = fs::read_to_string(OSRELEASE_PATH)?;
    let release = release.trim();
    if release.is_empty() {
        return Err(InterferoError::EbpfError(
            "empty kernel release string".to_string(),
        ));
    }
    Ok(release.to_string())
}

fn path_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(InterferoError::EbpfError(format!(
            "cannot check if {} exists: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let vmlinux = dir.path().join("vmlinux");
        fs::write(&vmlinux, b"btf").unwrap();

        let source = BtfSource::detect_with(&vmlinux, dir.path(), || {
            panic!("release must not be read when BTF is embedded")
        })
        .unwrap();
        assert!(source.is_embedded());
    }

    #[test]
    fn test_detect_external() {
        let dir = tempfile::tempdir().unwrap();
        let vmlinux = dir.path().join("missing");

        let source =
            BtfSource::detect_with(&vmlinux, Path::new("/btf"), || Ok("5.4.0-1".into())).unwrap();
        assert_eq!(
            source,
            BtfSource::External {
                path: PathBuf::from("/btf/vmlinux-5.4.0-1"),
                release: "5.4.0-1".into(),
            }
        );
    }
}
