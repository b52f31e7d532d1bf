//! Cgroup directory naming for pod containers
//!
//! The kubelet names a container's cgroup directory per cgroup driver:
//! - systemd: `cri-containerd-<id>.scope/`
//! - cgroupfs: `<id>/`
//!
//! The scheduler program keys its tables by that last path component, see
//! [`CgroupPathFormatter::container_cgroup_name`].

use interfero::{InterferoError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    Cgroupfs,
    Systemd,
    Unresolved,
}

impl CgroupDriver {
    pub fn is_valid(&self) -> bool {
        !matches!(self, CgroupDriver::Unresolved)
    }

    /// Parse the kubelet's `cgroupDriver` setting
    pub fn from_kubelet(value: &str) -> Self {
        match value {
            "systemd" => CgroupDriver::Systemd,
            "cgroupfs" => CgroupDriver::Cgroupfs,
            _ => CgroupDriver::Unresolved,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CgroupDriver::Cgroupfs => "cgroupfs",
            CgroupDriver::Systemd => "systemd",
            CgroupDriver::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for CgroupDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container runtimes whose ids can be mapped to a cgroup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeType {
    Containerd,
    Docker,
    Crio,
}

/// Split `<runtime>://<hash>` as reported in a pod's container status
pub fn parse_container_id(container_id: &str) -> Result<(RuntimeType, &str)> {
    let unsupported = || InterferoError::UnsupportedContainerId(container_id.to_string());

    let (scheme, hash) = container_id.split_once("://").ok_or_else(unsupported)?;
    if hash.is_empty() || hash.contains('/') {
        return Err(unsupported());
    }

    let runtime = match scheme {
        "containerd" => RuntimeType::Containerd,
        "docker" => RuntimeType::Docker,
        "cri-o" => RuntimeType::Crio,
        _ => return Err(unsupported()),
    };
    Ok((runtime, hash))
}

/// Builds container cgroup directory names for one resolved driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupPathFormatter {
    driver: CgroupDriver,
}

impl CgroupPathFormatter {
    pub fn new(driver: CgroupDriver) -> Result<Self> {
        if !driver.is_valid() {
            return Err(InterferoError::CgroupError(
                "cgroup driver must be resolved before formatting paths".to_string(),
            ));
        }
        Ok(Self { driver })
    }

    pub fn container_dir(&self, container_id: &str) -> Result<String> {
        let (runtime, hash) = parse_container_id(container_id)?;
        Ok(match self.driver {
            CgroupDriver::Systemd => match runtime {
                RuntimeType::Containerd => format!("cri-containerd-{}.scope/", hash),
                RuntimeType::Docker => format!("docker-{}.scope/", hash),
                RuntimeType::Crio => format!("crio-{}.scope/", hash),
            },
            _ => format!("{}/", hash),
        })
    }

    /// Kernel-side key of a container: its directory name without the trailing `/`
    pub fn container_cgroup_name(&self, container_id: &str) -> Result<String> {
        let mut dir = self.container_dir(container_id)?;
        dir.pop();
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn systemd() -> CgroupPathFormatter {
        CgroupPathFormatter::new(CgroupDriver::Systemd).unwrap()
    }

    fn cgroupfs() -> CgroupPathFormatter {
        CgroupPathFormatter::new(CgroupDriver::Cgroupfs).unwrap()
    }

    #[test]
    fn test_unresolved_driver_rejected() {
        assert!(CgroupPathFormatter::new(CgroupDriver::Unresolved).is_err());
    }

    #[test]
    fn test_parse_container_id() {
        assert_eq!(
            parse_container_id("containerd://abc").unwrap(),
            (RuntimeType::Containerd, "abc")
        );
        assert_eq!(
            parse_container_id("cri-o://abc").unwrap(),
            (RuntimeType::Crio, "abc")
        );
        assert!(parse_container_id("abc").is_err());
        assert!(parse_container_id("containerd://").is_err());
        assert!(parse_container_id("rkt://abc").is_err());
    }

    #[test]
    fn test_systemd_container_dirs() {
        let f = systemd();
        assert_eq!(
            f.container_dir("containerd://c1").unwrap(),
            "cri-containerd-c1.scope/"
        );
        assert_eq!(f.container_dir("docker://c1").unwrap(), "docker-c1.scope/");
        assert_eq!(f.container_dir("cri-o://c1").unwrap(), "crio-c1.scope/");
        assert_eq!(
            f.container_cgroup_name("containerd://c1").unwrap(),
            "cri-containerd-c1.scope"
        );
    }

    #[test]
    fn test_cgroupfs_container_dirs() {
        let f = cgroupfs();
        assert_eq!(f.container_dir("docker://c1").unwrap(), "c1/");
        assert_eq!(f.container_cgroup_name("containerd://c1").unwrap(), "c1");
    }
}
