//! Phi-accrual failure detector.
//!
//! Instead of a fixed liveness timeout, each backend is judged against its
//! own probe-timing history: phi grows as the time since the last check
//! exceeds what is typical for that backend, and a single threshold turns
//! the accrued suspicion into a boolean verdict.

use crate::health::history::ProbeHistory;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

/// Probe connect deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Threshold applied when the configured value is not positive.
const DEFAULT_PHI_THRESHOLD: f64 = 8.0;

/// Callback invoked with each probe verdict: `(backend key, healthy)`.
pub type HealthUpdateFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Periodic TCP prober with phi-accrual suspicion tracking.
///
/// Backend histories live behind their own mutexes inside the map, so
/// concurrent probes to different backends do not contend.
pub struct FailureDetector {
    interval: Duration,
    phi_threshold: f64,
    histories: DashMap<String, Arc<Mutex<ProbeHistory>>>,
}

impl FailureDetector {
    pub fn new(check_interval: Duration, phi_threshold: f64) -> Self {
        let phi_threshold = if phi_threshold <= 0.0 {
            DEFAULT_PHI_THRESHOLD
        } else {
            phi_threshold
        };

        Self {
            interval: check_interval,
            phi_threshold,
            histories: DashMap::new(),
        }
    }

    /// Probe every target on a fixed interval until shutdown fires. Each
    /// tick spawns one probe task per target; each probe reports its verdict
    /// through `update`.
    pub async fn run(
        self: Arc<Self>,
        targets: Vec<String>,
        update: HealthUpdateFn,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            targets = targets.len(),
            interval = ?self.interval,
            phi_threshold = self.phi_threshold,
            "failure detector starting"
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for target in &targets {
                        let detector = Arc::clone(&self);
                        let target = target.clone();
                        let update = Arc::clone(&update);
                        tokio::spawn(async move {
                            let healthy = detector.check(&target).await;
                            update(&target, healthy);
                        });
                    }
                }
                _ = shutdown.recv() => {
                    info!("failure detector shutting down");
                    break;
                }
            }
        }
    }

    /// Probe one target. A refused or timed-out connect is an immediate
    /// failure; a successful connect feeds the history and defers to the
    /// phi predicate.
    pub async fn check(&self, target: &str) -> bool {
        let start = Instant::now();

        match timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                // Connect-only probe; close right away.
                drop(stream);
                self.record_success(target, start.elapsed());
                self.is_healthy(target)
            }
            Ok(Err(e)) => {
                debug!(target, error = %e, "health probe failed");
                self.record_failure(target);
                false
            }
            Err(_) => {
                debug!(target, "health probe timed out");
                self.record_failure(target);
                false
            }
        }
    }

    /// Accrued suspicion for a target. 0.0 for targets that were never
    /// checked or have no successful samples yet.
    pub fn phi(&self, target: &str) -> f64 {
        let Some(history) = self.history(target) else {
            return 0.0;
        };
        let history = history.lock().unwrap();
        self.phi_at(&history, Instant::now())
    }

    /// `phi < threshold`, strictly: a target sitting exactly on the
    /// threshold is already considered down.
    pub fn is_healthy(&self, target: &str) -> bool {
        self.phi(target) < self.phi_threshold
    }

    pub fn phi_threshold(&self) -> f64 {
        self.phi_threshold
    }

    fn phi_at(&self, history: &ProbeHistory, now: Instant) -> f64 {
        let Some(last_check) = history.last_check() else {
            return 0.0;
        };
        if history.count() == 0 {
            return 0.0;
        }

        let delta = now.saturating_duration_since(last_check).as_secs_f64();
        let mean = history.mean();
        let mut std_dev = history.std_dev();
        if std_dev == 0.0 {
            std_dev = mean / 10.0;
        }

        let y = (delta - mean) / std_dev;
        -libm::log10(normal_cdf(-y))
    }

    fn record_success(&self, target: &str, elapsed: Duration) {
        let history = self.history_entry(target);
        history.lock().unwrap().record_success(elapsed, Instant::now());
    }

    fn record_failure(&self, target: &str) {
        let history = self.history_entry(target);
        history.lock().unwrap().record_failure(Instant::now());
    }

    fn history(&self, target: &str) -> Option<Arc<Mutex<ProbeHistory>>> {
        self.histories.get(target).map(|entry| Arc::clone(&entry))
    }

    /// Fetch or lazily create a target's history. The map shard lock is
    /// released before the per-target mutex is taken.
    fn history_entry(&self, target: &str) -> Arc<Mutex<ProbeHistory>> {
        Arc::clone(
            &self
                .histories
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProbeHistory::new()))),
        )
    }
}

/// Standard-normal cumulative distribution function.
fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}
