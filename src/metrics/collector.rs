//! Metrics collector using prometheus-client.
//!
//! Tracks proxied sessions, relayed bytes, dropped clients, pool usage, and
//! backend health.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-backend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    pub backend: String,
}

/// Labels for dropped-client metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    pub reason: DropReason,
}

/// Why a client connection was dropped before relaying.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DropReason {
    NoBackend,
    UnknownBackend,
    Unhealthy,
    Capacity,
    Dial,
}

/// Labels for relayed-bytes metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub backend: String,
    pub direction: Direction,
}

/// Relay direction that finished a session.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client_to_backend"),
            Direction::BackendToClient => write!(f, "backend_to_client"),
        }
    }
}

/// Labels for health probe metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub backend: String,
    pub result: ProbeResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Healthy,
    Unhealthy,
}

/// Collects and stores all metrics. Cheap to clone.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Completed relay sessions.
    sessions_total: Family<BackendLabels, Counter>,
    /// Session duration histogram (seconds).
    session_duration_seconds: Family<BackendLabels, Histogram>,
    /// Sessions currently being relayed.
    active_sessions: Family<BackendLabels, Gauge>,
    /// Bytes relayed on the direction that completed each session.
    bytes_total: Family<BytesLabels, Counter>,
    /// Clients dropped before relaying, by reason.
    dropped_total: Family<DropLabels, Counter>,
    /// Backend health flag (1 = healthy, 0 = unhealthy).
    backend_health: Family<BackendLabels, Gauge>,
    /// Health probe verdicts.
    health_checks_total: Family<ProbeLabels, Counter>,
    /// Pool connections currently checked out.
    pool_active: Gauge,
    /// Pool connections currently idle.
    pool_idle: Gauge,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let sessions_total = Family::<BackendLabels, Counter>::default();
        let session_duration_seconds = Family::<BackendLabels, Histogram>::new_with_constructor(
            || {
                // Buckets from 1ms to ~25min; sessions can be long-lived.
                Histogram::new(exponential_buckets(0.001, 4.0, 11))
            },
        );
        let active_sessions = Family::<BackendLabels, Gauge>::default();
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let dropped_total = Family::<DropLabels, Counter>::default();
        let backend_health = Family::<BackendLabels, Gauge>::default();
        let health_checks_total = Family::<ProbeLabels, Counter>::default();
        let pool_active = Gauge::default();
        let pool_idle = Gauge::default();

        registry.register(
            "ringlb_sessions",
            "Total number of relayed sessions",
            sessions_total.clone(),
        );
        registry.register(
            "ringlb_session_duration_seconds",
            "Session duration in seconds",
            session_duration_seconds.clone(),
        );
        registry.register(
            "ringlb_active_sessions",
            "Number of sessions currently being relayed",
            active_sessions.clone(),
        );
        registry.register(
            "ringlb_bytes",
            "Bytes relayed on the completing direction",
            bytes_total.clone(),
        );
        registry.register(
            "ringlb_dropped_clients",
            "Client connections dropped before relaying",
            dropped_total.clone(),
        );
        registry.register(
            "ringlb_backend_health",
            "Backend health status (1=healthy, 0=unhealthy)",
            backend_health.clone(),
        );
        registry.register(
            "ringlb_health_checks",
            "Health probe verdicts",
            health_checks_total.clone(),
        );
        registry.register(
            "ringlb_pool_active_connections",
            "Pool connections currently checked out",
            pool_active.clone(),
        );
        registry.register(
            "ringlb_pool_idle_connections",
            "Pool connections currently cached",
            pool_idle.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                sessions_total,
                session_duration_seconds,
                active_sessions,
                bytes_total,
                dropped_total,
                backend_health,
                health_checks_total,
                pool_active,
                pool_idle,
                registry,
            }),
        }
    }

    /// Prometheus registry for text encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a completed relay session.
    pub fn record_session(
        &self,
        backend: &str,
        direction: Direction,
        bytes: u64,
        duration: Duration,
    ) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.sessions_total.get_or_create(&labels).inc();
        self.inner
            .session_duration_seconds
            .get_or_create(&labels)
            .observe(duration.as_secs_f64());

        let bytes_labels = BytesLabels {
            backend: backend.to_string(),
            direction,
        };
        self.inner
            .bytes_total
            .get_or_create(&bytes_labels)
            .inc_by(bytes);
    }

    pub fn session_opened(&self, backend: &str) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.active_sessions.get_or_create(&labels).inc();
    }

    pub fn session_closed(&self, backend: &str) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner.active_sessions.get_or_create(&labels).dec();
    }

    /// Count a client dropped before relaying.
    pub fn record_drop(&self, reason: DropReason) {
        self.inner
            .dropped_total
            .get_or_create(&DropLabels { reason })
            .inc();
    }

    /// Set a backend's health gauge.
    pub fn set_backend_health(&self, backend: &str, healthy: bool) {
        let labels = BackendLabels {
            backend: backend.to_string(),
        };
        self.inner
            .backend_health
            .get_or_create(&labels)
            .set(if healthy { 1 } else { 0 });
    }

    /// Count one health probe verdict.
    pub fn record_health_check(&self, backend: &str, healthy: bool) {
        let labels = ProbeLabels {
            backend: backend.to_string(),
            result: if healthy {
                ProbeResult::Healthy
            } else {
                ProbeResult::Unhealthy
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Refresh the pool gauges; called on scrape.
    pub fn set_pool_usage(&self, active: usize, idle: usize) {
        self.inner.pool_active.set(active as i64);
        self.inner.pool_idle.set(idle as i64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_encode() {
        let collector = MetricsCollector::new();

        collector.record_session(
            "10.0.0.1:9001",
            Direction::ClientToBackend,
            128,
            Duration::from_millis(12),
        );
        collector.session_opened("10.0.0.1:9001");
        collector.record_drop(DropReason::Unhealthy);
        collector.set_backend_health("10.0.0.1:9001", false);
        collector.record_health_check("10.0.0.1:9001", false);
        collector.set_pool_usage(3, 2);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, collector.registry()).unwrap();

        assert!(buffer.contains("ringlb_sessions"));
        assert!(buffer.contains("ringlb_dropped_clients"));
        assert!(buffer.contains("ringlb_backend_health"));
        assert!(buffer.contains("ringlb_pool_active_connections"));
    }
}
