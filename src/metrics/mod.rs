//! Prometheus metrics.

mod collector;

pub use collector::{Direction, DropReason, MetricsCollector};
