//! Integration tests for ringlb.
//!
//! These drive the full dispatch path over real sockets: ring selection,
//! registry health gating, pooled upstream connections, and the byte relay.

use ringlb::balancer::{Backend, BackendRegistry, Balancer};
use ringlb::config::PoolConfig;
use ringlb::hashing::HashRing;
use ringlb::health::{FailureDetector, HealthUpdateFn};
use ringlb::metrics::MetricsCollector;
use ringlb::pool::ConnectionPool;
use ringlb::util::ShutdownSignal;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Echo server that answers every read with the same bytes, keeps each
/// connection open, and counts accepted connections (= upstream dials).
async fn start_echo_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dials);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, dials)
}

/// Server that answers every request with its own `host:port` tag followed
/// by a newline, so a client can tell which backend served it.
async fn start_tag_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tag = format!("{}\n", addr);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if stream.write_all(tag.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Server that consumes input but never answers, holding sessions open.
async fn start_slow_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });

    addr
}

struct TestBalancer {
    addr: SocketAddr,
    ring: Arc<HashRing>,
    registry: Arc<BackendRegistry>,
    pool: Arc<ConnectionPool>,
    shutdown: ShutdownSignal,
}

/// Assemble the dispatch engine over the given backends with weight 1 each.
async fn start_balancer(backends: &[SocketAddr], pool_cfg: PoolConfig) -> TestBalancer {
    let registry = Arc::new(BackendRegistry::new());
    let ring = Arc::new(HashRing::new());
    for addr in backends {
        let backend = registry.register(Backend::new(addr.ip().to_string(), addr.port(), 1));
        ring.add(&backend.key(), backend.weight());
    }

    let pool = Arc::new(ConnectionPool::new(&pool_cfg).unwrap());
    let shutdown = ShutdownSignal::new();

    let balancer = Balancer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(&ring),
        Arc::clone(&registry),
        Arc::clone(&pool),
        MetricsCollector::new(),
    )
    .await
    .unwrap();
    let addr = balancer.local_addr().unwrap();
    tokio::spawn(balancer.run(shutdown.subscribe()));

    TestBalancer {
        addr,
        ring,
        registry,
        pool,
        shutdown,
    }
}

fn pool_config(max_idle: usize, max_active: usize, idle_timeout: Duration) -> PoolConfig {
    PoolConfig {
        max_idle,
        max_active,
        idle_timeout,
    }
}

/// Poll a condition instead of sleeping a fixed amount.
async fn eventually<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s: {what}");
}

#[tokio::test]
async fn test_single_backend_echo() {
    let (backend, _dials) = start_echo_server().await;
    let lb = start_balancer(&[backend], pool_config(2, 4, Duration::from_secs(60))).await;

    let mut client = TcpStream::connect(lb.addr).await.unwrap();
    client.write_all(b"hello\n").await.unwrap();

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\n");

    drop(client);
    let pool = Arc::clone(&lb.pool);
    eventually(move || pool.active() == 0, "session released its connection").await;

    lb.shutdown.shutdown();
}

#[tokio::test]
async fn test_consistent_hash_stickiness() {
    let mut backends = Vec::new();
    for _ in 0..3 {
        backends.push(start_tag_server().await);
    }
    let lb = start_balancer(&backends, pool_config(4, 16, Duration::from_secs(60))).await;

    for _ in 0..20 {
        let mut client = TcpStream::connect(lb.addr).await.unwrap();

        // The dispatcher routes on the client's remote address string, which
        // is this socket's local address. Predict the backend with an
        // independent ring lookup.
        let routing_key = client.local_addr().unwrap().to_string();
        let expected = lb.ring.get(&routing_key).unwrap();

        client.write_all(b"who\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        let tag = std::str::from_utf8(&buf[..n]).unwrap().trim().to_string();

        assert_eq!(tag, expected, "client {} landed on the wrong backend", routing_key);
    }

    lb.shutdown.shutdown();
}

#[tokio::test]
async fn test_idle_reuse_avoids_second_dial() {
    let (backend, dials) = start_echo_server().await;
    let lb = start_balancer(&[backend], pool_config(2, 2, Duration::from_secs(60))).await;

    for round in 0..2 {
        let mut client = TcpStream::connect(lb.addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        let pool = Arc::clone(&lb.pool);
        eventually(
            move || pool.active() == 0 && pool.idle_total() == 1,
            "connection parked after session",
        )
        .await;

        assert_eq!(dials.load(Ordering::SeqCst), 1, "round {} re-dialed", round);
    }

    lb.shutdown.shutdown();
}

#[tokio::test]
async fn test_active_cap_drops_second_client() {
    let backend = start_slow_server().await;
    let lb = start_balancer(&[backend], pool_config(1, 1, Duration::from_secs(60))).await;

    // First client occupies the only pool slot; the slow backend never
    // answers, so the session stays open.
    let mut first = TcpStream::connect(lb.addr).await.unwrap();
    first.write_all(b"hold").await.unwrap();
    let pool = Arc::clone(&lb.pool);
    eventually(move || pool.active() == 1, "first session checked out the slot").await;

    // Second client is dropped at acquire time. It writes nothing, so the
    // close arrives as a clean EOF.
    let mut second = TcpStream::connect(lb.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = second.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "second client should see EOF, not data");

    // The first session is still alive.
    assert!(first.write_all(b"still here").await.is_ok());

    lb.shutdown.shutdown();
}

#[tokio::test]
async fn test_unhealthy_backend_excluded() {
    // A port that was bound and then released: nothing listens there.
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let lb = start_balancer(&[closed], pool_config(2, 4, Duration::from_secs(60))).await;

    let detector = Arc::new(FailureDetector::new(Duration::from_millis(50), 8.0));
    let update: HealthUpdateFn = {
        let registry = Arc::clone(&lb.registry);
        Arc::new(move |key: &str, healthy: bool| {
            registry.set_healthy(key, healthy);
        })
    };
    tokio::spawn(Arc::clone(&detector).run(
        lb.registry.keys(),
        update,
        lb.shutdown.subscribe(),
    ));

    let registry = Arc::clone(&lb.registry);
    let key = closed.to_string();
    eventually(
        move || !registry.resolve(&key).unwrap().is_healthy(),
        "detector marked the closed backend unhealthy",
    )
    .await;

    // Clients keyed to the unhealthy backend are dropped without data.
    let mut client = TcpStream::connect(lb.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    lb.shutdown.shutdown();
}

#[tokio::test]
async fn test_idle_timeout_forces_redial() {
    let (backend, dials) = start_echo_server().await;
    let lb = start_balancer(&[backend], pool_config(2, 2, Duration::from_millis(50))).await;

    let mut client = TcpStream::connect(lb.addr).await.unwrap();
    client.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    drop(client);

    let pool = Arc::clone(&lb.pool);
    eventually(move || pool.idle_total() == 1, "connection parked").await;

    // Let the parked connection age past the idle timeout.
    tokio::time::sleep(Duration::from_millis(120)).await;

    let mut client = TcpStream::connect(lb.addr).await.unwrap();
    client.write_all(b"two").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");
    drop(client);

    let dials = Arc::clone(&dials);
    eventually(
        move || dials.load(Ordering::SeqCst) == 2,
        "stale connection was closed and replaced",
    )
    .await;

    lb.shutdown.shutdown();
}

#[test]
fn test_config_parsing_from_file() {
    use ringlb::config::load_config;
    use std::io::Write as IoWrite;
    use tempfile::NamedTempFile;

    let config_content = r#"
global:
  log_level: info

balancer:
  port: 9000
  health_check_interval: 5s
  failure_threshold: 8.0

backends:
  - host: "127.0.0.1"
    port: 9001
    weight: 2
  - host: "127.0.0.1"
    port: 9002

pool:
  max_idle: 4
  max_active: 32
  idle_timeout: 90s
"#;

    let mut temp_file = NamedTempFile::new().expect("failed to create temp file");
    temp_file
        .write_all(config_content.as_bytes())
        .expect("failed to write config");

    let config = load_config(temp_file.path()).expect("failed to load config");

    assert_eq!(config.balancer.port, 9000);
    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.backends[0].weight, 2);
    assert_eq!(config.backends[1].weight, 1);
    assert_eq!(config.pool.max_active, 32);
}
