//! UDP discovery: who is serving on this network, and what do they share
//!
//! A probe is two raw bytes: the big-endian port the prober wants replies
//! sent to. A reply is one datagram holding the same JSON response
//! envelope the control channel uses, carrying a `ServerInfo`. Replies go
//! unicast to `(prober_ip, response_port)` - not necessarily the port the
//! probe left from.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::message::{Response, ServerInfo};

const PROBE_LEN: usize = 2;
const MAX_DATAGRAM: usize = 64 * 1024;

/// Answer discovery probes forever. The payload is regenerated per
/// response so it always reflects the live sharing list. Malformed probes
/// are logged and dropped; only socket failures end the loop.
pub async fn serve_responder<F>(bind: SocketAddr, info_source: F) -> Result<()>
where
    F: Fn() -> ServerInfo + Send + Sync,
{
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("bind discovery {}", bind))?;
    eprintln!("discovery responder listening on {}", bind);
    let mut buf = [0u8; 256];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await.context("discovery recv")?;
        if n < PROBE_LEN {
            eprintln!("discovery: short probe ({} bytes) from {}", n, peer);
            continue;
        }
        let response_port = u16::from_be_bytes([buf[0], buf[1]]);
        if response_port == 0 {
            eprintln!("discovery: invalid response port from {}", peer);
            continue;
        }
        let envelope = match serde_json::to_vec(&Response::ok(
            serde_json::to_value(info_source()).unwrap_or_default(),
        )) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("discovery: encode failed: {}", e);
                continue;
            }
        };
        let dest = SocketAddr::new(peer.ip(), response_port);
        if let Err(e) = socket.send_to(&envelope, dest).await {
            eprintln!("discovery: reply to {} failed: {}", dest, e);
        }
    }
}

/// Broadcast a probe and collect responses for up to `budget`.
///
/// Each parseable response is handed to `accept`, which returns whether
/// to keep listening. The loop stops at the first `false`, when the
/// budget runs out, or on a socket error. Unparsable datagrams are
/// ignored.
pub async fn discover<F>(discovery_port: u16, budget: Duration, accept: F) -> Result<()>
where
    F: FnMut(ServerInfo) -> bool,
{
    let target = SocketAddr::new("255.255.255.255".parse().unwrap(), discovery_port);
    discover_at(target, budget, accept).await
}

/// Probe an explicit target (unicast works too; tests rely on this).
pub async fn discover_at<F>(target: SocketAddr, budget: Duration, mut accept: F) -> Result<()>
where
    F: FnMut(ServerInfo) -> bool,
{
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind probe socket")?;
    socket.set_broadcast(true).context("enable broadcast")?;
    let response_port = socket.local_addr().context("probe local addr")?.port();
    socket
        .send_to(&response_port.to_be_bytes(), target)
        .await
        .with_context(|| format!("send probe to {}", target))?;

    let deadline = Instant::now() + budget;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Ok(());
        };
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => return Ok(()), // budget exhausted while waiting
            Ok(Err(e)) => return Err(e).context("discovery recv"),
            Ok(Ok((n, _peer))) => {
                let Some(info) = parse_response(&buf[..n]) else {
                    continue;
                };
                if !accept(info) {
                    return Ok(());
                }
            }
        }
    }
}

/// Collect every response seen within the budget.
pub async fn discover_all(discovery_port: u16, budget: Duration) -> Result<Vec<ServerInfo>> {
    let mut found = Vec::new();
    discover(discovery_port, budget, |info| {
        found.push(info);
        true
    })
    .await?;
    Ok(found)
}

fn parse_response(datagram: &[u8]) -> Option<ServerInfo> {
    let envelope: Response = serde_json::from_slice(datagram).ok()?;
    if !envelope.success {
        return None;
    }
    serde_json::from_value(envelope.data?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FileType, SharingInfo};

    fn sample_info() -> ServerInfo {
        ServerInfo {
            name: "box".into(),
            ip: "127.0.0.1".into(),
            port: 9040,
            auth_required: false,
            ssl_enabled: false,
            sharings: vec![SharingInfo {
                name: "docs".into(),
                ftype: FileType::Dir,
                read_only: true,
            }],
        }
    }

    async fn spawn_responder() -> SocketAddr {
        // Bind first so the port is known, then serve on that socket's
        // address via a fresh responder task
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        tokio::spawn(async move {
            let _ = serve_responder(addr, sample_info).await;
        });
        // Give the responder a beat to bind
        tokio::time::sleep(Duration::from_millis(50)).await;
        addr
    }

    #[tokio::test]
    async fn test_probe_and_collect() {
        let addr = spawn_responder().await;
        let mut found = Vec::new();
        discover_at(addr, Duration::from_secs(2), |info| {
            found.push(info);
            false // stop at the first response
        })
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "box");
        assert_eq!(found[0].sharings[0].name, "docs");
    }

    #[tokio::test]
    async fn test_stop_early_beats_budget() {
        let addr = spawn_responder().await;
        let started = std::time::Instant::now();
        discover_at(addr, Duration::from_secs(10), |_| false)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_server_times_out_empty() {
        // A bound socket that never answers
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sink.local_addr().unwrap();

        let budget = Duration::from_millis(300);
        let started = std::time::Instant::now();
        let mut count = 0usize;
        discover_at(addr, budget, |_| {
            count += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(count, 0);
        assert!(started.elapsed() >= budget);
    }

    #[tokio::test]
    async fn test_short_probe_ignored_listener_survives() {
        let addr = spawn_responder().await;

        // One malformed probe first; the responder must drop it and live
        let poke = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        poke.send_to(&[0x01], addr).await.unwrap();

        let mut found = Vec::new();
        discover_at(addr, Duration::from_secs(2), |info| {
            found.push(info);
            false
        })
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
    }
}
