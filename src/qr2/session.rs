//! Matchmaking Session Registry
//!
//! One entry per client-chosen session id. Every operation runs under a single
//! registry-wide lock, so multi-step sequences such as "check challenge, then
//! mark authenticated" are atomic with respect to concurrent datagrams.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::rng::random_alphanumeric;
use crate::qr2::protocol::Heartbeat;

/// Client-chosen session identifier.
pub type SessionId = u32;

/// Length of generated challenge text.
pub const CHALLENGE_LEN: usize = 6;

/// Authentication progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Heartbeat seen, no challenge issued yet.
    Unauthenticated,
    /// Challenge issued, waiting for the client to answer.
    ChallengePending,
    /// Challenge answered.
    Authenticated,
}

/// Per-client matchmaking session.
#[derive(Debug, Clone)]
pub struct MatchmakingSession {
    /// Session identifier.
    pub session_id: SessionId,
    /// Set once a CHALLENGE arrives after a challenge was issued.
    pub authenticated: bool,
    /// Issued challenge text. Empty until one is sent.
    pub challenge: String,
    /// Last UDP source address seen for this session.
    pub public_addr: Option<SocketAddr>,
    /// Most recent liveness signal.
    pub last_keepalive: Instant,
    /// Most recent heartbeat report.
    pub report: Heartbeat,
}

impl MatchmakingSession {
    /// Create a zero-valued session.
    pub fn new(session_id: SessionId, now: Instant) -> Self {
        Self {
            session_id,
            authenticated: false,
            challenge: String::new(),
            public_addr: None,
            last_keepalive: now,
            report: Heartbeat::default(),
        }
    }

    /// Current authentication state.
    pub fn state(&self) -> SessionState {
        if self.authenticated {
            SessionState::Authenticated
        } else if !self.challenge.is_empty() {
            SessionState::ChallengePending
        } else {
            SessionState::Unauthenticated
        }
    }

    /// Reported field by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.report.get(key)
    }
}

/// What the engine should do after a heartbeat was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Client requested shutdown; entry removed (if it existed).
    Removed {
        /// Whether an entry was present.
        existed: bool,
    },
    /// Send (or resend) this challenge.
    Challenge {
        /// Challenge text to send.
        challenge: String,
    },
    /// Nothing to send.
    Accepted,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No entry for this session id.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

/// Concurrent store of matchmaking sessions.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, MatchmakingSession>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Existing entry, or a freshly inserted zero-valued one.
    pub async fn get_or_create(&self, id: SessionId) -> MatchmakingSession {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id)
            .or_insert_with(|| MatchmakingSession::new(id, Instant::now()))
            .clone()
    }

    /// Snapshot of one entry.
    pub async fn get(&self, id: SessionId) -> Option<MatchmakingSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Remove an entry.
    pub async fn remove(&self, id: SessionId) -> Option<MatchmakingSession> {
        self.sessions.write().await.remove(&id)
    }

    /// Number of live entries.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Apply a heartbeat atomically.
    ///
    /// `heartbeat` must already be reconciled against `observed`;
    /// `address_confirmed` is the result of that reconciliation.
    pub async fn record_heartbeat(
        &self,
        id: SessionId,
        heartbeat: Heartbeat,
        address_confirmed: bool,
        observed: SocketAddr,
        now: Instant,
    ) -> HeartbeatOutcome {
        let mut sessions = self.sessions.write().await;

        if heartbeat.is_shutdown() {
            let existed = sessions.remove(&id).is_some();
            return HeartbeatOutcome::Removed { existed };
        }

        let session = sessions
            .entry(id)
            .or_insert_with(|| MatchmakingSession::new(id, now));
        session.report = heartbeat;
        session.public_addr = Some(observed);
        session.last_keepalive = now;

        if session.authenticated && address_confirmed {
            return HeartbeatOutcome::Accepted;
        }

        if session.challenge.is_empty() {
            session.challenge = random_alphanumeric(CHALLENGE_LEN);
        }
        HeartbeatOutcome::Challenge {
            challenge: session.challenge.clone(),
        }
    }

    /// Handle a CHALLENGE reply.
    ///
    /// Returns `Ok(true)` when the session became (or stayed) authenticated and
    /// `Ok(false)` when no challenge was ever issued. The challenge text itself
    /// is not compared.
    pub async fn authenticate(&self, id: SessionId) -> Result<bool, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(RegistryError::UnknownSession(id))?;

        if session.challenge.is_empty() {
            return Ok(false);
        }
        session.authenticated = true;
        Ok(true)
    }

    /// Handle a KEEPALIVE.
    pub async fn touch(&self, id: SessionId, now: Instant) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(RegistryError::UnknownSession(id))?;
        session.last_keepalive = now;
        Ok(())
    }

    /// Remove every session silent for longer than `ttl`. Returns removed ids.
    pub async fn reap_expired(&self, now: Instant, ttl: Duration) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;

        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_keepalive) > ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            sessions.remove(id);
        }
        expired
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
