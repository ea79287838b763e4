//! Integration tests for the matchmaking UDP service.
//!
//! Drives the real listener over loopback.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test matchmaking_udp -- --nocapture

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use dwc_relay::qr2::{MatchmakingConfig, MatchmakingServer};
use tokio::net::UdpSocket;
use tokio::time::timeout;

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(200);

async fn start_server(config: MatchmakingConfig) -> (Arc<MatchmakingServer>, SocketAddr) {
    init_tracing();
    let server = Arc::new(MatchmakingServer::bind(config).await.expect("bind failed"));
    let addr = server.local_addr().expect("local addr");

    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.expect("server run failed");
    });

    (server, addr)
}

fn loopback_config() -> MatchmakingConfig {
    MatchmakingConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("client bind failed")
}

async fn exchange(socket: &UdpSocket, server: SocketAddr, datagram: &[u8]) -> Vec<u8> {
    socket.send_to(datagram, server).await.expect("send failed");
    let mut buf = [0u8; 1024];
    let (len, _) = timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("no reply")
        .expect("recv failed");
    buf[..len].to_vec()
}

async fn expect_silence(socket: &UdpSocket) {
    let mut buf = [0u8; 1024];
    assert!(
        timeout(SILENCE, socket.recv_from(&mut buf)).await.is_err(),
        "unexpected reply"
    );
}

fn heartbeat(session_id: u32, pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut out = vec![0x03];
    out.extend_from_slice(&session_id.to_be_bytes());
    for (key, value) in pairs {
        out.extend_from_slice(key.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out.push(0);
    out
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn heartbeat_challenge_then_registered() {
    let (server, addr) = start_server(loopback_config()).await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    // Reported address differs from the loopback source, so a challenge follows.
    let reply = exchange(&socket, addr, &heartbeat(1, &[("publicip", "1.2.3.4")])).await;
    assert_eq!(&reply[..7], &[0xFE, 0xFD, 0x01, 0, 0, 0, 1]);
    assert_eq!(*reply.last().unwrap(), 0);

    let challenge = &reply[7..13];
    let suffix = std::str::from_utf8(&reply[13..reply.len() - 1]).unwrap();
    assert_eq!(suffix, format!("007F000001{:04X}", local.port()));

    let session = server.sessions().get(1).await.expect("session created");
    assert_eq!(session.report.public_ip.as_deref(), Some("127.0.0.1"));
    assert!(!session.authenticated);

    let mut answer = vec![0x01, 0, 0, 0, 1];
    answer.extend_from_slice(challenge);
    let reply = exchange(&socket, addr, &answer).await;
    assert_eq!(reply, vec![0xFE, 0xFD, 0x0A, 0, 0, 0, 1]);
    assert!(server.sessions().get(1).await.unwrap().authenticated);

    // Matching address on an authenticated session: nothing to send.
    socket
        .send_to(&heartbeat(1, &[("publicip", "127.0.0.1")]), addr)
        .await
        .unwrap();
    expect_silence(&socket).await;

    server.shutdown();
}

#[tokio::test]
async fn challenge_without_heartbeat_is_ignored() {
    let (server, addr) = start_server(loopback_config()).await;
    let socket = client().await;

    socket.send_to(&[0x01, 0, 0, 0, 9, b'x'], addr).await.unwrap();
    expect_silence(&socket).await;
    assert!(server.sessions().get(9).await.is_none());

    server.shutdown();
}

#[tokio::test]
async fn available_answers_unknown_sessions() {
    let (server, addr) = start_server(loopback_config()).await;
    let socket = client().await;

    let reply = exchange(&socket, addr, &[0x09, 0, 0, 0, 42]).await;
    assert_eq!(reply, vec![0xFE, 0xFD, 0x09, 0, 0, 0, 0]);
    assert_eq!(server.sessions().session_count().await, 0);

    server.shutdown();
}

#[tokio::test]
async fn shutdown_heartbeat_removes_session() {
    let (server, addr) = start_server(loopback_config()).await;
    let socket = client().await;

    exchange(&socket, addr, &heartbeat(7, &[("hostname", "room")])).await;
    assert_eq!(server.sessions().session_count().await, 1);

    socket
        .send_to(&heartbeat(7, &[("statechanged", "2")]), addr)
        .await
        .unwrap();
    expect_silence(&socket).await;
    assert_eq!(server.sessions().session_count().await, 0);

    server.shutdown();
}

#[tokio::test]
async fn malformed_datagrams_do_not_stop_the_server() {
    let (server, addr) = start_server(loopback_config()).await;
    let socket = client().await;

    for junk in [&[][..], &[0x03, 0, 0][..], &[0x7F, 0, 0, 0, 1][..]] {
        socket.send_to(junk, addr).await.unwrap();
    }
    expect_silence(&socket).await;

    let reply = exchange(&socket, addr, &[0x09]).await;
    assert_eq!(&reply[..3], &[0xFE, 0xFD, 0x09]);

    server.shutdown();
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test]
async fn reaper_evicts_silent_sessions() {
    let config = MatchmakingConfig {
        session_ttl: Some(Duration::from_millis(100)),
        reap_interval: Duration::from_millis(50),
        ..loopback_config()
    };
    let (server, addr) = start_server(config).await;
    let socket = client().await;

    exchange(&socket, addr, &heartbeat(3, &[])).await;
    assert_eq!(server.sessions().session_count().await, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.sessions().session_count().await, 0);

    server.shutdown();
}
