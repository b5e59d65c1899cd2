//! End-to-end scenarios driven through a real SOCKS5 client against an
//! in-process proxy and a canned backend.

use faultgate::connection;
use faultgate::state::ProxyState;
use faultgate::types::Phase;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_socks::tcp::Socks5Stream;

/// Boots a proxy with fresh stores on an ephemeral port.
async fn spawn_proxy() -> (SocketAddr, Arc<ProxyState>) {
    let state = ProxyState::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(connection::run_acceptor(listener, state.clone()));
    (addr, state)
}

/// Backend that answers every received chunk with a canned HTTP response.
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let reply = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
                    if sock.write_all(reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Tunnels a CONNECT-shaped exchange through the proxy and measures the
/// round trip from first write to first response byte.
async fn tunneled_request(proxy: SocketAddr, backend: SocketAddr) -> Duration {
    let mut conn = Socks5Stream::connect(proxy, ("localhost", backend.port()))
        .await
        .expect("SOCKS5 handshake");
    let started = Instant::now();
    let connect_line = format!("CONNECT localhost:{} HTTP/1.1 \n", backend.port());
    conn.write_all(connect_line.as_bytes()).await.unwrap();
    conn.write_all(b"dontcare\n").await.unwrap();
    let mut buf = [0u8; 32 * 1024];
    let n = conn.read(&mut buf).await.unwrap();
    assert!(n > 0, "backend reply should arrive through the tunnel");
    started.elapsed()
}

/// Issues a plain GET through the tunnel and reports whether a response came
/// back before the proxy dropped the connection.
async fn plain_request_succeeds(proxy: SocketAddr, backend: SocketAddr) -> bool {
    let Ok(mut conn) = Socks5Stream::connect(proxy, ("localhost", backend.port())).await else {
        return false;
    };
    if conn.write_all(b"GET / HTTP/1.1\r\n\r\n").await.is_err() {
        return false;
    }
    let mut buf = [0u8; 1024];
    matches!(conn.read(&mut buf).await, Ok(n) if n > 0)
}

#[tokio::test]
async fn write_latency_applies_once() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;
    state
        .policy
        .set_latency("localhost", Phase::Write, Duration::from_millis(1001), 1)
        .await
        .unwrap();

    let first = tunneled_request(proxy, backend).await;
    assert!(
        first >= Duration::from_secs(1),
        "first request should see the injected write latency, took {first:?}"
    );
    assert!(first < Duration::from_millis(1900), "latency applied more than once: {first:?}");

    let second = tunneled_request(proxy, backend).await;
    assert!(
        second < Duration::from_millis(500),
        "one-shot rule must be spent after the first request, took {second:?}"
    );
}

#[tokio::test]
async fn read_latency_applies_once() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;
    state
        .policy
        .set_latency("localhost", Phase::Read, Duration::from_millis(1001), 1)
        .await
        .unwrap();

    // The read gate starts sleeping the moment the pump spawns, a hair
    // before the client's own clock starts, hence the small margin.
    let first = tunneled_request(proxy, backend).await;
    assert!(first >= Duration::from_millis(950), "took {first:?}");
    assert!(first < Duration::from_millis(1900), "took {first:?}");

    let second = tunneled_request(proxy, backend).await;
    assert!(second < Duration::from_millis(500), "took {second:?}");
}

#[tokio::test]
async fn connect_latency_applies_once() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;
    state
        .policy
        .set_latency("localhost", Phase::Connect, Duration::from_millis(1001), 1)
        .await
        .unwrap();

    // The connect gate sits between the SOCKS5 reply and the pumps; the
    // client sees it as a stalled first response.
    let first = tunneled_request(proxy, backend).await;
    assert!(
        first >= Duration::from_millis(950),
        "first request should stall on connect, took {first:?}"
    );
    assert!(first < Duration::from_millis(1900), "took {first:?}");

    let second = tunneled_request(proxy, backend).await;
    assert!(second < Duration::from_millis(500), "took {second:?}");
}

#[tokio::test]
async fn blacklist_terminates_connections() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;

    // Mutations are rejected while the blacklist is disabled.
    assert!(state.policy.set_blacklist("localhost", true).await.is_err());

    state.policy.enable_blacklist(true);
    state.policy.set_blacklist("localhost", true).await.unwrap();
    assert!(
        !plain_request_succeeds(proxy, backend).await,
        "blacklisted host must be unreachable"
    );

    state.policy.set_blacklist("localhost", false).await.unwrap();
    assert!(
        plain_request_succeeds(proxy, backend).await,
        "removing the host must restore connectivity"
    );
}

#[tokio::test]
async fn whitelist_gates_connections() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;

    state.policy.enable_whitelist(true);
    assert!(
        !plain_request_succeeds(proxy, backend).await,
        "hosts off the whitelist must be unreachable"
    );

    state.policy.set_whitelist("localhost", true).await.unwrap();
    assert!(
        plain_request_succeeds(proxy, backend).await,
        "whitelisted host must be reachable"
    );

    state.policy.set_whitelist("localhost", false).await.unwrap();
    assert!(
        !plain_request_succeeds(proxy, backend).await,
        "removal must cut the host off again"
    );
}

#[tokio::test]
async fn counters_survive_a_session() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;
    state
        .policy
        .set_latency("localhost", Phase::Write, Duration::from_millis(1001), 1)
        .await
        .unwrap();

    tunneled_request(proxy, backend).await;

    let host_port = format!("localhost:{}", backend.port());
    let snapshot = state.metrics.snapshot();
    assert!(snapshot[&format!("bytes;{host_port};Out")] > 0.0);
    assert!(snapshot["bytes;Total;Out"] > 0.0);
    assert!(snapshot["conns;Total;All"] >= 1.0);
    assert!(
        snapshot[&format!("latencyPerRemoteWrite;{host_port};Total")] >= 1.0,
        "injected write latency must be attributed to its phase counter"
    );
}

#[tokio::test]
async fn bytes_out_matches_what_the_client_wrote() {
    let (proxy, state) = spawn_proxy().await;
    let backend = spawn_backend().await;

    let mut conn = Socks5Stream::connect(proxy, ("localhost", backend.port()))
        .await
        .unwrap();
    let payload = b"GET / HTTP/1.1\r\nhost: localhost\r\n\r\n";
    conn.write_all(payload).await.unwrap();
    let mut buf = [0u8; 1024];
    conn.read(&mut buf).await.unwrap();
    drop(conn);

    // Give the pipeline a moment to tear down and flush counters.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(state.metrics.get("bytes;Total;Out"), payload.len() as f64);
}
