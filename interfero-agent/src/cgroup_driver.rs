//! Cgroup driver detection
//!
//! The driver is guessed from the name of the node's root `kubepods` cgroup
//! first. When that is inconclusive the kubelet's `/configz` endpoint is asked,
//! using the port the kubelet published in the node status. Both are retried
//! on a fixed poll interval until a deadline.

use crate::cgroup::CgroupDriver;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use interfero::k8s::{kubelet_port, K8sClient};
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DRIVER_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DRIVER_POLL_TIMEOUT: Duration = Duration::from_secs(60);

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const KUBELET_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Guess the driver from the directory name the kubelet created for pods.
///
/// On the unified hierarchy the root itself is inspected, on v1 the `cpu`
/// controller. Seeing both names, or neither, is inconclusive.
pub fn driver_from_cgroup_name(cgroup_root: &Path) -> CgroupDriver {
    let base = if cgroup_root.join("cgroup.controllers").exists() {
        cgroup_root.to_path_buf()
    } else {
        cgroup_root.join("cpu")
    };

    let systemd = base.join("kubepods.slice").is_dir();
    let cgroupfs = base.join("kubepods").is_dir();

    match (systemd, cgroupfs) {
        (true, false) => CgroupDriver::Systemd,
        (false, true) => CgroupDriver::Cgroupfs,
        _ => CgroupDriver::Unresolved,
    }
}

#[derive(Debug, Deserialize)]
struct Configz {
    kubeletconfig: KubeletConfiguration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration {
    #[serde(default)]
    cgroup_driver: String,
}

/// Extract the driver from a kubelet `/configz` response body
pub fn driver_from_configz(body: &[u8]) -> Result<CgroupDriver> {
    let configz: Configz =
        serde_json::from_slice(body).context("Failed to decode kubelet configz")?;
    Ok(CgroupDriver::from_kubelet(&configz.kubeletconfig.cgroup_driver))
}

/// Second opinion consulted when the cgroup tree is inconclusive
#[async_trait]
pub trait DriverFallback: Send + Sync {
    async fn guess(&self) -> Result<CgroupDriver>;
}

/// Asks the local kubelet for its configured driver
pub struct KubeletConfigz {
    k8s: K8sClient,
    node_name: String,
    http: reqwest::Client,
    token_path: PathBuf,
}

impl KubeletConfigz {
    pub fn new(k8s: K8sClient, node_name: &str) -> Result<Self> {
        // The kubelet serves a self-signed certificate.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(KUBELET_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build kubelet HTTP client")?;

        Ok(Self {
            k8s,
            node_name: node_name.to_string(),
            http,
            token_path: PathBuf::from(SERVICE_ACCOUNT_TOKEN),
        })
    }

    async fn fetch(&self, port: u16) -> Result<CgroupDriver> {
        let url = format!("https://127.0.0.1:{}/configz", port);
        let mut request = self.http.get(&url);

        match tokio::fs::read_to_string(&self.token_path).await {
            Ok(token) => request = request.bearer_auth(token.trim()),
            Err(e) => debug!(
                "No service account token at {}: {}",
                self.token_path.display(),
                e
            ),
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("GET {}", url))?
            .error_for_status()
            .with_context(|| format!("GET {}", url))?;
        let body = response.bytes().await.context("Failed to read configz body")?;

        driver_from_configz(&body)
    }
}

#[async_trait]
impl DriverFallback for KubeletConfigz {
    async fn guess(&self) -> Result<CgroupDriver> {
        let node = self.k8s.get_node(&self.node_name).await?;
        let port = kubelet_port(&node)
            .ok_or_else(|| anyhow!("node {} has no kubelet endpoint port", self.node_name))?;
        self.fetch(port).await
    }
}

pub struct CgroupDriverResolver<F> {
    cgroup_root: PathBuf,
    fallback: F,
    poll_interval: Duration,
    timeout: Duration,
}

impl<F: DriverFallback> CgroupDriverResolver<F> {
    pub fn new(cgroup_root: &Path, fallback: F) -> Self {
        Self {
            cgroup_root: cgroup_root.to_path_buf(),
            fallback,
            poll_interval: DRIVER_POLL_INTERVAL,
            timeout: DRIVER_POLL_TIMEOUT,
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.timeout = timeout;
        self
    }

    /// One detection attempt, local probe first
    pub async fn try_resolve(&self) -> CgroupDriver {
        let driver = driver_from_cgroup_name(&self.cgroup_root);
        if driver.is_valid() {
            return driver;
        }
        info!("Can not detect cgroup driver from 'kubepods' cgroup name");

        match self.fallback.guess().await {
            Ok(driver) if driver.is_valid() => driver,
            Ok(_) => {
                warn!("Kubelet reported no usable cgroup driver, retrying");
                CgroupDriver::Unresolved
            }
            Err(e) => {
                warn!("Guessing kubelet cgroup driver failed, retrying: {:#}", e);
                CgroupDriver::Unresolved
            }
        }
    }

    /// Poll immediately and then every interval until a driver is found
    pub async fn resolve(&self) -> Result<CgroupDriver> {
        let attempts = async {
            loop {
                let driver = self.try_resolve().await;
                if driver.is_valid() {
                    return driver;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(driver) => Ok(driver),
            Err(_) => bail!(
                "can not detect kubelet cgroup driver within {:?}",
                self.timeout
            ),
        }
    }
}
