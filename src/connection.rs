//! faultgate/src/connection.rs
//! Acceptor loop, per-connection pipeline, and the two forwarding pumps.

use crate::metrics::{ACTIVE_CONNS, TOTAL_BYTES_IN, TOTAL_BYTES_OUT, TOTAL_CONNS};
use crate::policy::Verdict;
use crate::protocol;
use crate::state::ProxyState;
use crate::types::{Phase, TargetAddr};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Grace period between the first pump finishing and both sockets closing,
/// so in-flight writes in the other direction can land.
const DRAIN_SLEEP: Duration = Duration::from_millis(100);

/// Accept loop. Accept errors are logged and the listener keeps going;
/// nothing at runtime terminates it.
pub async fn run_acceptor(listener: TcpListener, state: Arc<ProxyState>) {
    loop {
        match listener.accept().await {
            Ok((inbound, peer)) => {
                debug!(%peer, "accepted connection");
                let state = state.clone();
                tokio::spawn(async move { handle_conn(state, inbound).await });
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
}

/// Random token correlating all log lines of one connection.
fn request_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(15)
        .map(char::from)
        .collect()
}

/// Per-connection pipeline: SOCKS5 negotiation, connect-latency gate, then
/// the two pumps until either side finishes.
pub async fn handle_conn(state: Arc<ProxyState>, mut inbound: TcpStream) {
    let rid = request_id();

    let (outbound, target) = match protocol::handshake(&mut inbound, &state.resolver).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(rid = %rid, "SOCKS5 negotiation failed: {}", e);
            return;
        }
    };
    info!(rid = %rid, target = %target, "new connection");

    let host_port = target.host_and_port();
    state.metrics.inc(&format!("conns;{};Total", host_port));
    state.metrics.inc(TOTAL_CONNS);
    state.metrics.inc(ACTIVE_CONNS);

    // Connect-latency gate. The store hands back a duration; the sleep itself
    // happens with no lock held.
    let sleep = state.policy.lookup_and_consume(Phase::Connect, &target).await;
    if sleep > Duration::ZERO {
        tokio::time::sleep(sleep).await;
        info!(rid = %rid, target = %target, "slept {} per connect", humantime::format_duration(sleep));
        state.metrics.add(
            &format!("latencyPerRequest;{};Total", host_port),
            sleep.as_secs_f64(),
        );
    }

    let (client_read, client_write) = inbound.into_split();
    let (remote_read, remote_write) = outbound.into_split();

    // Capacity 2: the second pump to finish must never block on the
    // rendezvous once the pipeline has already torn down.
    let (done_tx, mut done_rx) = mpsc::channel::<()>(2);

    let policy_pump = tokio::spawn(policy_pump(
        state.clone(),
        rid.clone(),
        target,
        client_read,
        remote_write,
        done_tx.clone(),
    ));
    let direct_pump = tokio::spawn(direct_pump(
        state.clone(),
        host_port.clone(),
        remote_read,
        client_write,
        done_tx,
    ));

    // Wait for either direction to finish, let pending writes drain, then
    // drop both halves of both sockets, which unblocks the other pump.
    done_rx.recv().await;
    tokio::time::sleep(DRAIN_SLEEP).await;
    policy_pump.abort();
    direct_pump.abort();

    state.metrics.dec(ACTIVE_CONNS);
    debug!(rid = %rid, host = %host_port, "closed connections");
}

/// Client->remote pump: the only side that evaluates policy. Each chunk goes
/// through read-latency gate, read, CONNECT sniffing, access control,
/// write-latency gate, then the write, in that order.
async fn policy_pump(
    state: Arc<ProxyState>,
    rid: String,
    mut target: TargetAddr,
    mut client: OwnedReadHalf,
    mut remote: OwnedWriteHalf,
    done: mpsc::Sender<()>,
) {
    let host_port = target.host_and_port();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let sleep = state.policy.lookup_and_consume(Phase::Read, &target).await;
        if sleep > Duration::ZERO {
            tokio::time::sleep(sleep).await;
            info!(rid = %rid, target = %target, "slept {} per remote read", humantime::format_duration(sleep));
            state.metrics.add(
                &format!("latencyPerRemoteRead;{};Total", host_port),
                sleep.as_secs_f64(),
            );
        }

        let n = match client.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(rid = %rid, "client read failed: {}", e);
                break;
            }
        };

        if let Some(host) = sniff_connect_host(&buf[..n]) {
            debug!(rid = %rid, proxy_host = %host, "intercepted CONNECT");
            target.proxy_host = host;
        }

        match state.policy.check_access(&target) {
            Verdict::Deny => {
                info!(rid = %rid, target = %target, "closing connection denied by access list");
                state.metrics.inc(&format!("closed;{};Total", host_port));
                let _ = remote.shutdown().await;
                break;
            }
            Verdict::Allow => {
                state.metrics.inc(&format!("allowed;{};Total", host_port));
            }
            Verdict::Open => {}
        }

        let sleep = state.policy.lookup_and_consume(Phase::Write, &target).await;
        if sleep > Duration::ZERO {
            tokio::time::sleep(sleep).await;
            info!(rid = %rid, target = %target, "slept {} per remote write", humantime::format_duration(sleep));
            state.metrics.add(
                &format!("latencyPerRemoteWrite;{};Total", host_port),
                sleep.as_secs_f64(),
            );
        }

        state.metrics.add(TOTAL_BYTES_OUT, n as f64);
        state.metrics.add(&format!("bytes;{};Out", host_port), n as f64);
        state.metrics.inc(&format!("writes;{};Out", host_port));
        if let Err(e) = remote.write_all(&buf[..n]).await {
            warn!(rid = %rid, "remote write failed: {}", e);
            break;
        }
    }
    let _ = done.send(()).await;
}

/// Remote->client pump: a plain copy accumulating ingress metrics. This side
/// never consults the policy store.
async fn direct_pump(
    state: Arc<ProxyState>,
    host_port: String,
    mut remote: OwnedReadHalf,
    mut client: OwnedWriteHalf,
    done: mpsc::Sender<()>,
) {
    let n = tokio::io::copy(&mut remote, &mut client).await.unwrap_or(0);
    state.metrics.add(TOTAL_BYTES_IN, n as f64);
    state.metrics.add(&format!("bytes;{};In", host_port), n as f64);
    state.metrics.inc(&format!("writes;{};In", host_port));
    let _ = done.send(()).await;
}

/// Bounded parse of an intercepted `CONNECT <host>:<port> ...` request line.
/// Anything that does not match that shape yields None and leaves the target
/// untouched.
fn sniff_connect_host(chunk: &[u8]) -> Option<String> {
    let rest = chunk.strip_prefix(b"CONNECT ")?;
    let line = rest.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let authority = line.split_whitespace().next()?;
    let (host, port) = authority.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(host.to_string())
}
