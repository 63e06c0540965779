//! Per-destination connection pool.
//!
//! Amortizes backend TCP dial cost across short client sessions while
//! bounding total resource usage: one global cap on checked-out connections
//! and one per-destination cap on cached idle connections.

use crate::config::PoolConfig;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Connect deadline for new backend connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the background stale-entry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors surfaced by pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("max active connections reached ({0})")]
    CapacityExhausted(usize),

    #[error("failed to dial {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("connection timeout dialing {0}")]
    DialTimeout(String),

    #[error("connection not issued by this pool")]
    NotFromPool,
}

/// A connection checked out of the pool.
///
/// Records the address it was dialed for, so `release` files it under the
/// right bucket without consulting the socket. Only the pool constructs
/// these, and `release`/`discard` consume them by value: a foreign
/// connection cannot enter the pool and a double release does not compile.
pub struct PooledConn {
    stream: TcpStream,
    addr: String,
}

impl PooledConn {
    /// Destination address this connection was issued for.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

struct IdleEntry {
    stream: TcpStream,
    parked_at: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Connections currently checked out (or mid-dial, which reserves a slot).
    active: usize,
    /// Idle buckets keyed by destination address; insertion order, so the
    /// last element is the most recently parked connection.
    idle: HashMap<String, Vec<IdleEntry>>,
}

/// Connection pool with a global active cap and per-destination idle caching.
///
/// The mutex guards O(1) bookkeeping only; dialing happens outside the lock
/// against a reserved capacity slot.
pub struct ConnectionPool {
    max_idle: usize,
    max_active: usize,
    idle_timeout: Duration,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Build a pool from validated configuration. All limits must be
    /// positive.
    pub fn new(cfg: &PoolConfig) -> Result<Self, PoolError> {
        if cfg.max_idle == 0 {
            return Err(PoolError::InvalidConfig("max_idle must be positive"));
        }
        if cfg.max_active == 0 {
            return Err(PoolError::InvalidConfig("max_active must be positive"));
        }
        if cfg.idle_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("idle_timeout must be positive"));
        }

        Ok(Self {
            max_idle: cfg.max_idle,
            max_active: cfg.max_active,
            idle_timeout: cfg.idle_timeout,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Check a connection out for `addr`, reusing the most recently parked
    /// idle connection when one is fresh enough, dialing otherwise.
    pub async fn acquire(&self, addr: &str) -> Result<PooledConn, PoolError> {
        {
            let mut state = self.state.lock().unwrap();

            if let Some(entry) = state.idle.get_mut(addr).and_then(Vec::pop) {
                if entry.parked_at.elapsed() <= self.idle_timeout {
                    state.active += 1;
                    trace!(addr, "reusing pooled connection");
                    return Ok(PooledConn {
                        stream: entry.stream,
                        addr: addr.to_string(),
                    });
                }
                // Stale; close it and fall through to dialing. Anything
                // deeper in the bucket is older still.
                drop(entry);
                trace!(addr, "discarded stale pooled connection");
            }

            if state.active >= self.max_active {
                return Err(PoolError::CapacityExhausted(self.max_active));
            }
            // Reserve the slot before dialing so concurrent acquirers can
            // never push `active` past the cap while a dial is in flight.
            state.active += 1;
        }

        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(addr, "dialed new backend connection");
                Ok(PooledConn {
                    stream,
                    addr: addr.to_string(),
                })
            }
            Ok(Err(source)) => {
                self.unreserve();
                Err(PoolError::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                self.unreserve();
                Err(PoolError::DialTimeout(addr.to_string()))
            }
        }
    }

    /// Return a connection for reuse. The bucket is capped at `max_idle`;
    /// overflow connections are closed.
    pub fn release(&self, conn: PooledConn) -> Result<(), PoolError> {
        let PooledConn { stream, addr } = conn;
        let mut state = self.state.lock().unwrap();

        if state.active == 0 {
            return Err(PoolError::NotFromPool);
        }
        state.active -= 1;

        let bucket = state.idle.entry(addr).or_default();
        if bucket.len() >= self.max_idle {
            // Bucket full; dropping the stream closes it.
            return Ok(());
        }
        bucket.push(IdleEntry {
            stream,
            parked_at: Instant::now(),
        });
        Ok(())
    }

    /// Return a connection's capacity slot and close it instead of caching.
    /// Used when the session ended uncleanly and the socket may be half
    /// open.
    pub fn discard(&self, conn: PooledConn) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap();

        if state.active == 0 {
            return Err(PoolError::NotFromPool);
        }
        state.active -= 1;
        drop(state);

        trace!(addr = %conn.addr, "discarded backend connection");
        Ok(())
    }

    /// Close every idle connection and drop all buckets. Checked-out
    /// connections are not tracked by identity and are left to their
    /// holders.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        let buckets = state.idle.len();
        state.idle.clear();
        debug!(buckets, "connection pool closed");
    }

    /// Periodically evict idle connections past their timeout and delete
    /// empty buckets, until shutdown fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut tick = interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv() => {
                    info!("pool sweeper shutting down");
                    break;
                }
            }
        }
    }

    fn sweep(&self) {
        let mut state = self.state.lock().unwrap();
        let before: usize = state.idle.values().map(Vec::len).sum();

        let idle_timeout = self.idle_timeout;
        state.idle.retain(|_, bucket| {
            bucket.retain(|entry| entry.parked_at.elapsed() <= idle_timeout);
            !bucket.is_empty()
        });

        let after: usize = state.idle.values().map(Vec::len).sum();
        if before != after {
            debug!(evicted = before - after, "swept stale pooled connections");
        }
    }

    /// Number of connections currently checked out.
    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    /// Number of idle connections across all buckets.
    pub fn idle_total(&self) -> usize {
        self.state.lock().unwrap().idle.values().map(Vec::len).sum()
    }

    /// Number of idle connections cached for one destination.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .idle
            .get(addr)
            .map_or(0, Vec::len)
    }

    fn unreserve(&self) {
        let mut state = self.state.lock().unwrap();
        state.active -= 1;
    }
}
