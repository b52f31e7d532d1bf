use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InterferoError {
    #[error("eBPF error: {0}")]
    EbpfError(String),

    #[error("Failed to load eBPF program: {0}")]
    ProgramLoadFailed(String),

    #[error("Failed to attach eBPF program: {0}")]
    AttachFailed(String),

    #[error("Failed to read eBPF map {map}: {reason}")]
    MapReadFailed { map: String, reason: String },

    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Cgroup error: {0}")]
    CgroupError(String),

    #[error("Unsupported container id {0:?}")]
    UnsupportedContainerId(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("BTF file {path} not available for kernel {release}")]
    BtfFileMissing { path: String, release: String },

    #[error("{0}")]
    Teardown(MultiError),
}

impl From<prometheus::Error> for InterferoError {
    fn from(e: prometheus::Error) -> Self {
        InterferoError::MetricsError(e.to_string())
    }
}

impl From<kube::Error> for InterferoError {
    fn from(e: kube::Error) -> Self {
        InterferoError::KubernetesError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InterferoError>;

/// Errors collected while releasing several resources in one go.
///
/// Every release is attempted; a failure is recorded and the next one still runs.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<InterferoError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: InterferoError) {
        self.errors.push(err);
    }

    /// Record the error of `result`, if any
    pub fn collect<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise every collected error
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(InterferoError::Teardown(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, e)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_multi_error_is_ok() {
        let errs = MultiError::new();
        assert!(errs.is_empty());
        assert!(errs.into_result().is_ok());
    }

    #[test]
    fn test_multi_error_keeps_every_failure() {
        let mut errs = MultiError::new();
        errs.collect::<()>(Err(InterferoError::AttachFailed("sched_wakeup".into())));
        errs.collect(Ok(()));
        errs.collect::<()>(Err(InterferoError::EbpfError("close maps".into())));

        assert_eq!(errs.len(), 2);
        let msg = errs.into_result().unwrap_err().to_string();
        assert!(msg.starts_with("2 error(s) occurred"));
        assert!(msg.contains("sched_wakeup"));
        assert!(msg.contains("close maps"));
    }

    #[test]
    fn test_collect_returns_value() {
        let mut errs = MultiError::new();
        assert_eq!(errs.collect(Ok(7)), Some(7));
        assert!(errs.is_empty());
    }
}
