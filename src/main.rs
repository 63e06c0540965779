//! ringlb - A consistent-hashing TCP load balancer
//!
//! Usage:
//!     ringlb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use ringlb::admin::AdminServer;
use ringlb::balancer::{Backend, BackendRegistry, Balancer};
use ringlb::config::{load_config, Config};
use ringlb::hashing::HashRing;
use ringlb::health::{FailureDetector, HealthUpdateFn};
use ringlb::metrics::MetricsCollector;
use ringlb::pool::ConnectionPool;
use ringlb::util::{init_logging, ShutdownSignal};

/// A consistent-hashing TCP load balancer.
#[derive(Parser, Debug)]
#[command(name = "ringlb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides the configured log level.
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        println!("Configuration is valid.");
        println!("  Listen port: {}", config.balancer.port);
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {} [weight {}]", backend.key(), backend.weight);
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        port = config.balancer.port,
        backends = config.backends.len(),
        "ringlb starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config))
}

/// Async entry point: wire the dispatch engine together, run until a
/// shutdown signal arrives, then drain.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    // Registry and ring share the `host:port` key space.
    let registry = Arc::new(BackendRegistry::new());
    let ring = Arc::new(HashRing::new());
    for bc in &config.backends {
        let backend = registry.register(Backend::new(bc.host.clone(), bc.port, bc.weight));
        ring.add(&backend.key(), backend.weight());
        metrics.set_backend_health(&backend.key(), true);
        info!(backend = %backend.key(), weight = backend.weight(), "configured backend");
    }

    let pool = Arc::new(ConnectionPool::new(&config.pool).context("creating connection pool")?);
    tokio::spawn(Arc::clone(&pool).run_sweeper(shutdown.subscribe()));

    let detector = Arc::new(FailureDetector::new(
        config.balancer.health_check_interval,
        config.balancer.failure_threshold,
    ));
    let update: HealthUpdateFn = {
        let registry = Arc::clone(&registry);
        let metrics = metrics.clone();
        Arc::new(move |key: &str, healthy: bool| {
            registry.set_healthy(key, healthy);
            metrics.set_backend_health(key, healthy);
            metrics.record_health_check(key, healthy);
        })
    };
    tokio::spawn(Arc::clone(&detector).run(registry.keys(), update, shutdown.subscribe()));

    if config.admin.enabled {
        let admin = AdminServer::new(config.admin.address, metrics.clone(), Arc::clone(&pool));
        tokio::spawn(admin.run(shutdown.subscribe()));
    }

    let listen = SocketAddr::from(([0, 0, 0, 0], config.balancer.port));
    let balancer = Balancer::bind(
        listen,
        Arc::clone(&ring),
        Arc::clone(&registry),
        Arc::clone(&pool),
        metrics.clone(),
    )
    .await
    .context("binding client listener")?;
    let balancer_task = tokio::spawn(balancer.run(shutdown.subscribe()));

    wait_for_signal().await;
    info!("received shutdown signal");

    shutdown.shutdown();
    if let Err(e) = balancer_task.await {
        error!(error = %e, "balancer task failed");
    }
    pool.close();

    info!("ringlb stopped");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
