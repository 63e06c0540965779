//! Client-facing accept loop and per-connection dispatch.
//!
//! Every accepted connection is routed through the hash ring to a backend,
//! handed a pooled upstream connection, and relayed byte-for-byte in both
//! directions until either side finishes.

use crate::balancer::BackendRegistry;
use crate::hashing::HashRing;
use crate::metrics::{Direction, DropReason, MetricsCollector};
use crate::pool::{ConnectionPool, PoolError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Accepts client connections and proxies them to consistently-hashed
/// backends.
pub struct Balancer {
    listener: TcpListener,
    ring: Arc<HashRing>,
    registry: Arc<BackendRegistry>,
    pool: Arc<ConnectionPool>,
    metrics: MetricsCollector,
}

impl Balancer {
    /// Bind the client listener. A bind failure is fatal to startup.
    pub async fn bind(
        listen: SocketAddr,
        ring: Arc<HashRing>,
        registry: Arc<BackendRegistry>,
        pool: Arc<ConnectionPool>,
        metrics: MetricsCollector,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!(listen = %listener.local_addr()?, "balancer listening");

        Ok(Self {
            listener,
            ring,
            registry,
            pool,
            metrics,
        })
    }

    /// Actual bound address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown fires. In-flight sessions are not
    /// interrupted; they drain as their relays complete.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            self.handle_connection(stream, client_addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("balancer shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        let ring = Arc::clone(&self.ring);
        let registry = Arc::clone(&self.registry);
        let pool = Arc::clone(&self.pool);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            dispatch(stream, client_addr, &ring, &registry, &pool, &metrics).await;
        });
    }
}

/// Route one client connection and relay it to completion. Every miss drops
/// the client: there is no failover to a second backend within a session.
async fn dispatch(
    mut client: TcpStream,
    client_addr: SocketAddr,
    ring: &HashRing,
    registry: &BackendRegistry,
    pool: &ConnectionPool,
    metrics: &MetricsCollector,
) {
    let routing_key = client_addr.to_string();

    let Some(backend_key) = ring.get(&routing_key) else {
        warn!(client = %client_addr, "no backend available on the ring");
        metrics.record_drop(DropReason::NoBackend);
        return;
    };

    let Some(backend) = registry.resolve(&backend_key) else {
        warn!(client = %client_addr, backend = %backend_key, "ring returned unknown backend");
        metrics.record_drop(DropReason::UnknownBackend);
        return;
    };

    if !backend.is_healthy() {
        debug!(client = %client_addr, backend = %backend_key, "backend unhealthy, dropping client");
        metrics.record_drop(DropReason::Unhealthy);
        return;
    }

    let mut upstream = match pool.acquire(&backend_key).await {
        Ok(conn) => conn,
        Err(e @ PoolError::CapacityExhausted(_)) => {
            warn!(client = %client_addr, backend = %backend_key, error = %e, "pool capacity exhausted");
            metrics.record_drop(DropReason::Capacity);
            return;
        }
        Err(e) => {
            warn!(client = %client_addr, backend = %backend_key, error = %e, "failed to reach backend");
            metrics.record_drop(DropReason::Dial);
            return;
        }
    };

    metrics.session_opened(&backend_key);
    let started = Instant::now();

    let (direction, result) = relay(&mut client, upstream.stream_mut()).await;
    let duration = started.elapsed();
    let clean = result.is_ok();

    match &result {
        Ok(bytes) => {
            debug!(
                client = %client_addr,
                backend = %backend_key,
                direction = %direction,
                bytes,
                duration_ms = duration.as_millis(),
                "session completed"
            );
            metrics.record_session(&backend_key, direction, *bytes, duration);
        }
        Err(e) => {
            // Mid-stream resets are routine; the session just tears down.
            debug!(
                client = %client_addr,
                backend = %backend_key,
                direction = %direction,
                error = %e,
                duration_ms = duration.as_millis(),
                "session ended with error"
            );
            metrics.record_session(&backend_key, direction, 0, duration);
        }
    }

    let _ = client.shutdown().await;
    drop(client);

    // A clean EOF lets the upstream go back in the pool; an errored relay
    // may leave it half open, so it is closed instead.
    let returned = if clean {
        pool.release(upstream)
    } else {
        pool.discard(upstream)
    };
    if let Err(e) = returned {
        error!(backend = %backend_key, error = %e, "pool bookkeeping error");
    }

    metrics.session_closed(&backend_key);
}

/// Copy bytes both ways and return as soon as one direction finishes. The
/// losing copy future is dropped with its borrows, which hands the upstream
/// stream back whole for the pool.
async fn relay(client: &mut TcpStream, upstream: &mut TcpStream) -> (Direction, io::Result<u64>) {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let client_to_backend = tokio::io::copy(&mut client_read, &mut upstream_write);
    let backend_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

    tokio::select! {
        result = client_to_backend => (Direction::ClientToBackend, result),
        result = backend_to_client => (Direction::BackendToClient, result),
    }
}
