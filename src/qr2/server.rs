//! Matchmaking UDP Server
//!
//! Receives one datagram per request and hands each to its own task, so the
//! receive loop never waits on registry work. Replies go back to the source
//! address of the request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::config::env_parse;
use crate::qr2::protocol::{
    challenge_frame, parse_datagram, response_header, Command, DatagramError, Heartbeat,
    Request, StateChange,
};
use crate::qr2::session::{HeartbeatOutcome, SessionId, SessionRegistry};

/// Reaper period when none is configured.
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Matchmaking server configuration.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Receive buffer size; longer datagrams are truncated by the OS.
    pub max_datagram: usize,
    /// Evict sessions with no liveness signal for this long.
    /// `None` disables the reaper.
    pub session_ttl: Option<Duration>,
    /// How often the reaper runs.
    pub reap_interval: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 27900)),
            max_datagram: 1024,
            session_ttl: None,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

impl MatchmakingConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("QR2_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_datagram: env_parse("QR2_MAX_DATAGRAM").unwrap_or(defaults.max_datagram),
            session_ttl: env_parse::<u64>("QR2_SESSION_TTL_SECS").map(Duration::from_secs),
            reap_interval: env_parse::<u64>("QR2_REAP_INTERVAL_SECS")
                .filter(|&secs| {
                    if secs == 0 {
                        warn!("QR2_REAP_INTERVAL_SECS must be non-zero; using default");
                    }
                    secs > 0
                })
                .map(Duration::from_secs)
                .unwrap_or(defaults.reap_interval),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind or query the socket.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// The matchmaking server.
pub struct MatchmakingServer {
    config: MatchmakingConfig,
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MatchmakingServer {
    /// Bind the UDP socket.
    pub async fn bind(config: MatchmakingConfig) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            socket: Arc::new(socket),
            sessions: Arc::new(SessionRegistry::new()),
            shutdown_tx,
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared session registry.
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// Run the receive loop until [`shutdown`](Self::shutdown) is called.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("Matchmaking server listening on {}", self.local_addr()?);

        let reaper_handle = match self.config.session_ttl {
            Some(ttl) => {
                let sessions = self.sessions.clone();
                let every = self.config.reap_interval;
                Some(tokio::spawn(async move {
                    Self::run_reaper_loop(sessions, ttl, every).await;
                }))
            }
            None => {
                warn!("No session TTL configured; abandoned matchmaking sessions are never reaped");
                None
            }
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; self.config.max_datagram];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => self.handle_datagram(buf[..len].to_vec(), addr),
                        Err(e) => warn!("Receive error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if let Some(handle) = reaper_handle {
            handle.abort();
        }

        Ok(())
    }

    /// Process one datagram on its own task.
    fn handle_datagram(&self, datagram: Vec<u8>, addr: SocketAddr) {
        let socket = self.socket.clone();
        let sessions = self.sessions.clone();

        tokio::spawn(async move {
            if let Some(reply) = process_datagram(&sessions, &datagram, addr).await {
                if let Err(e) = socket.send_to(&reply, addr).await {
                    warn!("Failed to reply to {}: {}", addr, e);
                }
            }
        });
    }

    /// Periodically evict sessions whose last liveness signal is older than `ttl`.
    async fn run_reaper_loop(sessions: Arc<SessionRegistry>, ttl: Duration, every: Duration) {
        let every = if every.is_zero() {
            warn!("Zero reap interval; using {:?}", DEFAULT_REAP_INTERVAL);
            DEFAULT_REAP_INTERVAL
        } else {
            every
        };
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let reaped = sessions.reap_expired(Instant::now(), ttl).await;
            if !reaped.is_empty() {
                info!("Reaped {} stale matchmaking sessions", reaped.len());
                debug!("Reaped session ids: {:?}", reaped);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run one datagram through the protocol state machine.
///
/// Returns the reply to send back to `from`, if any.
pub async fn process_datagram(
    sessions: &SessionRegistry,
    buf: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    let request = match parse_datagram(buf) {
        Ok(request) => request,
        Err(e @ DatagramError::UnknownCommand { .. }) => {
            error!("Dropping datagram from {}: {}", from, e);
            return None;
        }
        Err(e) => {
            warn!("Dropping datagram from {}: {} ({})", from, e, hex::encode(buf));
            return None;
        }
    };

    let (command, session_id, payload) = match request {
        Request::Available => {
            info!("QR2: Command: AVAILABLE from {}", from);
            return Some(response_header(Command::Available, 0));
        }
        Request::Session { command, session_id, payload } => (command, session_id, payload),
    };

    info!("QR2:{}: Command: {}", session_id, command.name());

    match command {
        Command::Heartbeat => handle_heartbeat(sessions, session_id, payload, from).await,

        Command::Challenge => match sessions.authenticate(session_id).await {
            Ok(true) => Some(response_header(Command::ClientRegistered, session_id)),
            Ok(false) => {
                debug!("QR2:{}: No challenge issued, ignoring", session_id);
                None
            }
            Err(e) => {
                warn!("QR2:{}: {}", session_id, e);
                None
            }
        },

        Command::KeepAlive => {
            if let Err(e) = sessions.touch(session_id, Instant::now()).await {
                warn!("QR2:{}: {}", session_id, e);
            }
            None
        }

        // Accepted for protocol completeness; nothing to do yet.
        Command::Query
        | Command::Echo
        | Command::AddError
        | Command::EchoResponse
        | Command::ClientMessage
        | Command::ClientMessageAck
        | Command::Available
        | Command::ClientRegistered => None,
    }
}

async fn handle_heartbeat(
    sessions: &SessionRegistry,
    session_id: SessionId,
    payload: &[u8],
    from: SocketAddr,
) -> Option<Vec<u8>> {
    info!("QR2:{}: Received heartbeat from {}", session_id, from);

    let mut heartbeat = Heartbeat::parse(payload);
    for (key, value) in &heartbeat.fields {
        debug!("QR2:{}: {}: {}", session_id, key, value);
    }

    match &heartbeat.state_changed {
        Some(StateChange::Update) => info!("QR2:{}: Client session update", session_id),
        Some(StateChange::Shutdown) => info!("QR2:{}: Client session shutdown", session_id),
        _ => {}
    }

    let confirmed = !heartbeat.is_shutdown() && heartbeat.reconcile_public_addr(&from);

    match sessions
        .record_heartbeat(session_id, heartbeat, confirmed, from, Instant::now())
        .await
    {
        HeartbeatOutcome::Removed { existed } => {
            if !existed {
                debug!("QR2:{}: Shutdown for unknown session", session_id);
            }
            None
        }
        HeartbeatOutcome::Challenge { challenge } => {
            info!("QR2:{}: Sending challenge", session_id);
            match challenge_frame(session_id, &challenge, &from) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!("QR2:{}: Cannot challenge {}: {}", session_id, from, e);
                    None
                }
            }
        }
        HeartbeatOutcome::Accepted => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qr2::session::SessionState;

    fn client() -> SocketAddr {
        "1.2.3.4:6500".parse().unwrap()
    }

    fn heartbeat_datagram(session_id: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![Command::Heartbeat as u8];
        buf.extend_from_slice(&session_id.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    fn header_only(command: Command, session_id: u32) -> Vec<u8> {
        let mut buf = vec![command as u8];
        buf.extend_from_slice(&session_id.to_be_bytes());
        buf
    }

    #[test]
    fn test_config_default() {
        let config = MatchmakingConfig::default();
        assert_eq!(config.bind_addr.port(), 27900);
        assert_eq!(config.max_datagram, 1024);
        assert!(config.session_ttl.is_none());
    }

    #[test]
    fn test_zero_reap_interval_keeps_default() {
        std::env::set_var("QR2_REAP_INTERVAL_SECS", "0");
        let config = MatchmakingConfig::from_env();
        std::env::remove_var("QR2_REAP_INTERVAL_SECS");
        assert_eq!(config.reap_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_reaper_survives_zero_interval() {
        let sessions = Arc::new(SessionRegistry::new());
        let handle = tokio::spawn(MatchmakingServer::run_reaper_loop(
            sessions,
            Duration::from_secs(60),
            Duration::ZERO,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_then_challenge_scenario() {
        let sessions = SessionRegistry::new();

        let reply = process_datagram(
            &sessions,
            &heartbeat_datagram(1, b"publicip\x001.2.3.4\x00\x00"),
            client(),
        )
        .await
        .expect("challenge expected");

        assert_eq!(&reply[..7], &[0xFE, 0xFD, 0x01, 0, 0, 0, 1]);
        let session = sessions.get(1).await.unwrap();
        assert_eq!(session.field("publicip"), Some("1.2.3.4"));
        assert_eq!(session.state(), SessionState::ChallengePending);
        assert_eq!(&reply[7..13], session.challenge.as_bytes());

        let reply = process_datagram(&sessions, &header_only(Command::Challenge, 1), client()).await;
        assert_eq!(reply, Some(vec![0xFE, 0xFD, 0x0A, 0x00, 0x00, 0x00, 0x01]));
        assert!(sessions.get(1).await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_heartbeat_missing_public_ip_always_challenges() {
        let sessions = SessionRegistry::new();
        process_datagram(&sessions, &heartbeat_datagram(1, b"publicip\x001.2.3.4\x00\x00"), client()).await;
        process_datagram(&sessions, &header_only(Command::Challenge, 1), client()).await;

        let reply = process_datagram(&sessions, &heartbeat_datagram(1, b"gamename\x00mkw\x00\x00"), client()).await;
        assert!(matches!(reply, Some(ref r) if r[2] == Command::Challenge as u8));

        let session = sessions.get(1).await.unwrap();
        assert_eq!(session.field("publicip"), Some("1.2.3.4"));
        assert_eq!(session.field("publicport"), Some("6500"));
    }

    #[tokio::test]
    async fn test_heartbeat_mismatched_public_ip_challenges() {
        let sessions = SessionRegistry::new();
        process_datagram(&sessions, &heartbeat_datagram(1, b"publicip\x001.2.3.4\x00\x00"), client()).await;
        process_datagram(&sessions, &header_only(Command::Challenge, 1), client()).await;

        let reply = process_datagram(&sessions, &heartbeat_datagram(1, b"publicip\x009.9.9.9\x00\x00"), client()).await;
        assert!(reply.is_some());
    }

    #[tokio::test]
    async fn test_matching_heartbeat_on_authenticated_session_is_silent() {
        let sessions = SessionRegistry::new();
        let hb = heartbeat_datagram(1, b"publicip\x001.2.3.4\x00\x00");
        process_datagram(&sessions, &hb, client()).await;
        process_datagram(&sessions, &header_only(Command::Challenge, 1), client()).await;

        assert_eq!(process_datagram(&sessions, &hb, client()).await, None);
    }

    #[tokio::test]
    async fn test_shutdown_heartbeat_removes_session() {
        let sessions = SessionRegistry::new();
        process_datagram(&sessions, &heartbeat_datagram(1, b"publicip\x001.2.3.4\x00\x00"), client()).await;

        let reply = process_datagram(&sessions, &heartbeat_datagram(1, b"statechanged\x002\x00\x00"), client()).await;
        assert_eq!(reply, None);
        assert!(sessions.get(1).await.is_none());
    }

    #[tokio::test]
    async fn test_update_heartbeat_continues_processing() {
        let sessions = SessionRegistry::new();
        let reply = process_datagram(
            &sessions,
            &heartbeat_datagram(1, b"statechanged\x001\x00publicip\x001.2.3.4\x00\x00"),
            client(),
        )
        .await;
        assert!(reply.is_some());
        assert!(sessions.get(1).await.is_some());
    }

    #[tokio::test]
    async fn test_challenge_without_prior_challenge_is_noop() {
        let sessions = SessionRegistry::new();
        sessions.get_or_create(5).await;

        let reply = process_datagram(&sessions, &header_only(Command::Challenge, 5), client()).await;
        assert_eq!(reply, None);
        assert!(!sessions.get(5).await.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_available_answered_for_unknown_session() {
        let sessions = SessionRegistry::new();
        let reply = process_datagram(&sessions, &header_only(Command::Available, 77), client()).await;
        assert_eq!(reply, Some(vec![0xFE, 0xFD, 0x09, 0, 0, 0, 0]));
        assert_eq!(sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_keepalive_for_unknown_session_is_dropped() {
        let sessions = SessionRegistry::new();
        let reply = process_datagram(&sessions, &header_only(Command::KeepAlive, 3), client()).await;
        assert_eq!(reply, None);
        assert_eq!(sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let sessions = SessionRegistry::new();
        assert_eq!(process_datagram(&sessions, &[], client()).await, None);
        assert_eq!(process_datagram(&sessions, &[0x03, 0x00], client()).await, None);
        assert_eq!(process_datagram(&sessions, &[0xEE, 0, 0, 0, 1], client()).await, None);
        assert_eq!(sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_placeholder_commands_do_not_mutate() {
        let sessions = SessionRegistry::new();
        for command in [Command::Query, Command::Echo, Command::AddError, Command::ClientMessage] {
            assert_eq!(process_datagram(&sessions, &header_only(command, 1), client()).await, None);
        }
        assert_eq!(sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_ipv6_peer_does_not_fault() {
        let sessions = SessionRegistry::new();
        let v6: SocketAddr = "[2001:db8::1]:6500".parse().unwrap();
        let reply = process_datagram(&sessions, &heartbeat_datagram(1, b"\x00"), v6).await;
        assert_eq!(reply, None);
        assert_eq!(sessions.get(1).await.unwrap().field("publicip"), Some("2001:db8::1"));
    }
}
