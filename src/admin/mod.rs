//! Admin HTTP endpoint.
//!
//! Serves the container-orchestrator liveness probe and the Prometheus
//! scrape target. The routing is owned by the server value, so several
//! balancers can coexist in one process.

use crate::metrics::MetricsCollector;
use crate::pool::ConnectionPool;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Liveness and metrics HTTP server.
pub struct AdminServer {
    address: SocketAddr,
    metrics: MetricsCollector,
    pool: Arc<ConnectionPool>,
}

impl AdminServer {
    pub fn new(address: SocketAddr, metrics: MetricsCollector, pool: Arc<ConnectionPool>) -> Self {
        Self {
            address,
            metrics,
            pool,
        }
    }

    /// Serve requests until shutdown fires. A bind failure is logged, not
    /// fatal; the balancer keeps running without its admin surface.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, address = %self.address, "failed to bind admin server");
                return;
            }
        };

        info!(address = %self.address, "admin server started");

        let metrics = self.metrics.clone();
        let pool = Arc::clone(&self.pool);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let metrics = metrics.clone();
                            let pool = Arc::clone(&pool);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let metrics = metrics.clone();
                                    let pool = Arc::clone(&pool);
                                    async move { handle_request(req, &metrics, &pool) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("admin server shutting down");
                    break;
                }
            }
        }
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: &MetricsCollector,
    pool: &ConnectionPool,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::from("Method not allowed\n")))
            .unwrap());
    }

    match req.uri().path() {
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK")))
            .unwrap()),

        "/metrics" => {
            metrics.set_pool_usage(pool.active(), pool.idle_total());

            let mut buffer = String::new();
            if let Err(e) = encode(&mut buffer, metrics.registry()) {
                error!(error = %e, "failed to encode metrics");
                return Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from("Failed to encode metrics\n")))
                    .unwrap());
            }

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(buffer)))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not found\n")))
            .unwrap()),
    }
}
