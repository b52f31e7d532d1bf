//! Gauge vectors whose label combinations expire when no longer written
//!
//! Container churn creates a new label combination for every container ever
//! seen. Each write stamps the combination; a periodic sweep unregisters the
//! ones that have not been written for `expire_after`.

use crate::{InterferoError, Result};
use prometheus::{GaugeVec, Opts};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default sweep period
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A label combination expires after this many sweep periods without a write
pub const DEFAULT_EXPIRE_RATIO: u32 = 5;

pub struct ExpiringGaugeVec {
    name: String,
    vec: GaugeVec,
    label_count: usize,
    last_seen: Mutex<HashMap<Vec<String>, Instant>>,
    expire_after: Duration,
}

impl ExpiringGaugeVec {
    pub fn new(opts: Opts, label_names: &[&str], expire_after: Duration) -> Result<Self> {
        let name = opts.fq_name();
        let vec = GaugeVec::new(opts, label_names)?;
        Ok(Self {
            name,
            vec,
            label_count: label_names.len(),
            last_seen: Mutex::new(HashMap::new()),
            expire_after,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying vector, to be registered with a registry
    pub fn gauge_vec(&self) -> &GaugeVec {
        &self.vec
    }

    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }

    /// Set the gauge for `label_values` and mark the combination as seen now
    pub fn set(&self, label_values: &[&str], value: f64) -> Result<()> {
        self.set_at(label_values, value, Instant::now())
    }

    pub fn set_at(&self, label_values: &[&str], value: f64, now: Instant) -> Result<()> {
        if label_values.len() != self.label_count {
            return Err(InterferoError::MetricsError(format!(
                "{}: expected {} label values, got {}",
                self.name,
                self.label_count,
                label_values.len()
            )));
        }

        // Gauge and stamp change under one lock hold; expire sees both or neither.
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        self.vec.get_metric_with_label_values(label_values)?.set(value);
        let key = label_values.iter().map(|v| v.to_string()).collect();
        last_seen.insert(key, now);
        Ok(())
    }

    /// Remove every label combination last written before `now - expire_after`.
    /// Returns how many were removed.
    pub fn expire(&self, now: Instant) -> usize {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        let before = last_seen.len();

        last_seen.retain(|labels, seen| {
            if now.saturating_duration_since(*seen) < self.expire_after {
                return true;
            }
            let values: Vec<&str> = labels.iter().map(String::as_str).collect();
            if let Err(e) = self.vec.remove_label_values(&values[..]) {
                debug!("{}: label set {:?} already gone: {}", self.name, labels, e);
            }
            false
        });

        before - last_seen.len()
    }

    /// Number of live label combinations
    pub fn len(&self) -> usize {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically expires stale label combinations of a set of vectors
pub struct ExpireSweeper {
    vecs: Vec<Arc<ExpiringGaugeVec>>,
    interval: Duration,
}

impl ExpireSweeper {
    pub fn new(vecs: Vec<Arc<ExpiringGaugeVec>>, interval: Duration) -> Self {
        Self { vecs, interval }
    }

    pub fn sweep(&self, now: Instant) -> usize {
        self.vecs
            .iter()
            .map(|v| {
                let removed = v.expire(now);
                if removed > 0 {
                    debug!("Expired {} label sets of {}", removed, v.name());
                }
                removed
            })
            .sum()
    }

    /// Sweep every interval until `stop` resolves
    pub async fn run<F>(self, stop: F)
    where
        F: Future<Output = ()>,
    {
        info!("Starting metric expiry sweeper every {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }

        info!("Metric expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn vec() -> ExpiringGaugeVec {
        ExpiringGaugeVec::new(
            Opts::new("test_latency", "test"),
            &["node", "container_id"],
            INTERVAL * DEFAULT_EXPIRE_RATIO,
        )
        .unwrap()
    }

    fn gathered(v: &ExpiringGaugeVec) -> usize {
        use prometheus::core::Collector;
        let text = prometheus::TextEncoder::new()
            .encode_to_string(&v.gauge_vec().collect())
            .unwrap();
        text.lines().filter(|l| !l.starts_with('#')).count()
    }

    #[test]
    fn test_label_set_lives_until_expiry() {
        let v = vec();
        let t = Instant::now();
        v.set_at(&["n1", "c1"], 1.0, t).unwrap();

        assert_eq!(v.expire(t + INTERVAL - Duration::from_millis(1)), 0);
        assert_eq!(gathered(&v), 1);

        assert_eq!(v.expire(t + INTERVAL * DEFAULT_EXPIRE_RATIO), 1);
        assert!(v.is_empty());
        assert_eq!(gathered(&v), 0);
    }

    #[test]
    fn test_rewrite_refreshes_last_seen() {
        let v = vec();
        let t = Instant::now();
        v.set_at(&["n1", "c1"], 1.0, t).unwrap();
        v.set_at(&["n1", "c1"], 2.0, t + INTERVAL * 4).unwrap();

        assert_eq!(v.expire(t + INTERVAL * DEFAULT_EXPIRE_RATIO), 0);
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn test_same_labels_single_entry() {
        let v = vec();
        v.set(&["n1", "c1"], 1.0).unwrap();
        v.set(&["n1", "c1"], 3.0).unwrap();
        v.set(&["n1", "c2"], 3.0).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(
            v.gauge_vec().with_label_values(&["n1", "c1"]).get(),
            3.0
        );
    }

    #[test]
    fn test_wrong_label_count() {
        let v = vec();
        assert!(v.set(&["n1"], 1.0).is_err());
        assert!(v.is_empty());
    }

    #[test]
    fn test_sweeper_covers_all_vecs() {
        let a = Arc::new(vec());
        let b = Arc::new(vec());
        let t = Instant::now();
        a.set_at(&["n1", "c1"], 1.0, t).unwrap();
        b.set_at(&["n1", "c2"], 1.0, t).unwrap();

        let sweeper = ExpireSweeper::new(vec![a.clone(), b.clone()], INTERVAL);
        assert_eq!(sweeper.sweep(t + INTERVAL * DEFAULT_EXPIRE_RATIO), 2);
    }

    #[tokio::test]
    async fn test_sweeper_stops() {
        let sweeper = ExpireSweeper::new(vec![Arc::new(vec())], Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(5), sweeper.run(async {}))
            .await
            .expect("sweeper must return once stopped");
    }

    #[test]
    fn test_concurrent_set_and_expire_stay_consistent() {
        let v = Arc::new(vec());
        let t = Instant::now();
        let stale = t + INTERVAL * DEFAULT_EXPIRE_RATIO;

        let setter = {
            let v = v.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let id = format!("c{}", i % 8);
                    v.set_at(&["n1", id.as_str()], 1.0, t).unwrap();
                }
            })
        };
        let expirer = {
            let v = v.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    v.expire(stale);
                }
            })
        };
        setter.join().unwrap();
        expirer.join().unwrap();

        assert_eq!(v.len(), gathered(&v));
    }
}
