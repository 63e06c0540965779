//! Backend registry.
//!
//! The authoritative table of configured backends and their current health
//! flag. The detector writes health through `set_healthy`; the dispatcher
//! reads it through `resolve`. Flag writes are last-writer-wins; staleness
//! bounded by one detector interval is harmless.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A configured upstream server.
pub struct Backend {
    host: String,
    port: u16,
    weight: u32,
    healthy: AtomicBool,
}

impl Backend {
    /// Backends start healthy; the detector demotes them.
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            healthy: AtomicBool::new(true),
        }
    }

    /// Canonical `host:port` key, shared with the hash ring and the pool.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

/// Table of backends keyed by `host:port`.
pub struct BackendRegistry {
    backends: DashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    /// Register a backend under its canonical key, replacing any previous
    /// entry for the same key.
    pub fn register(&self, backend: Backend) -> Arc<Backend> {
        let backend = Arc::new(backend);
        self.backends.insert(backend.key(), Arc::clone(&backend));
        backend
    }

    /// Look a backend up by its `host:port` key.
    pub fn resolve(&self, key: &str) -> Option<Arc<Backend>> {
        self.backends.get(key).map(|entry| Arc::clone(&entry))
    }

    /// Flip a backend's health flag. Returns false for unknown keys.
    pub fn set_healthy(&self, key: &str, healthy: bool) -> bool {
        match self.backends.get(key) {
            Some(backend) => {
                backend.set_healthy(healthy);
                true
            }
            None => false,
        }
    }

    /// Keys of all registered backends; the detector's probe targets.
    pub fn keys(&self) -> Vec<String> {
        self.backends.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
