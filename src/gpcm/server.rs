//! Presence TCP Server
//!
//! One task per client connection. Inbound bytes are split into GameSpy
//! frames and dispatched in order; outbound frames go through a bounded
//! channel drained by a writer task, so relays from other connections never
//! wait on this socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::config::env_parse;
use crate::core::gamespy::{take_frame, GameSpyCommand};
use crate::core::rng::{random_alphanumeric, random_session_key};
use crate::gpcm::directory::ProfileDirectory;
use crate::gpcm::error::{error_frame, FriendError, GpErrorCode};
use crate::gpcm::friend::FriendService;
use crate::gpcm::match_command::DwcMatchCodec;
use crate::gpcm::relay::{ChannelTransport, MessageKind, Transport};
use crate::gpcm::session::{ConnectionId, PresenceRegistry, ProfileId};

/// Inbound bytes allowed without a frame terminator before the client is dropped.
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// Time allowed to flush queued frames after a client disconnects.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Presence server configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Capacity of each friend list.
    pub friend_list_limit: usize,
    /// Outbound frames queued per connection before relays are dropped.
    pub outbound_queue: usize,
    /// JSON profile seed for the in-memory directory.
    pub profiles_path: Option<PathBuf>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 29900)),
            friend_list_limit: 100,
            outbound_queue: 64,
            profiles_path: None,
        }
    }
}

impl PresenceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("GPCM_BIND_ADDR").unwrap_or(defaults.bind_addr),
            friend_list_limit: env_parse("GPCM_FRIEND_LIMIT").unwrap_or(defaults.friend_list_limit),
            outbound_queue: env_parse("GPCM_OUTBOUND_QUEUE").unwrap_or(defaults.outbound_queue),
            profiles_path: env_parse("GPCM_PROFILES"),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind or query the listener.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep reading.
    Continue,
    /// Close the connection.
    Close,
}

/// Per-connection command handler.
pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    friends: Arc<FriendService>,
    directory: Arc<dyn ProfileDirectory>,
    profile_id: Option<ProfileId>,
    server_challenge: String,
}

impl Connection {
    /// Handler for a freshly accepted connection.
    pub fn new(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        friends: Arc<FriendService>,
        directory: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            id,
            transport,
            friends,
            directory,
            profile_id: None,
            server_challenge: random_alphanumeric(10),
        }
    }

    /// Logged-in profile, if any.
    pub fn profile_id(&self) -> Option<ProfileId> {
        self.profile_id
    }

    /// Send `\lc\1\challenge\..\id\1\final\`.
    pub fn greet(&self) {
        let greeting = GameSpyCommand::new("lc", "1")
            .with("challenge", self.server_challenge.as_str())
            .with("id", "1");
        self.write(&greeting);
    }

    /// Handle one raw frame.
    pub async fn handle_frame(&mut self, frame: &str) -> Disposition {
        let command = match GameSpyCommand::parse(frame) {
            Ok(command) => command,
            Err(e) => {
                warn!("GPCM: Unparsable frame from {}: {}", self.transport.remote_addr(), e);
                return self.reply_error(GpErrorCode::Parse, "Invalid frame");
            }
        };

        match command.command.as_str() {
            "login" => return self.login(&command).await,
            "ka" => {
                debug!("GPCM: Keepalive from {}", self.transport.remote_addr());
                return Disposition::Continue;
            }
            "logout" => return Disposition::Close,
            _ => {}
        }

        let Some(id) = self.profile_id else {
            warn!("GPCM: {:?} before login from {}", command.command, self.transport.remote_addr());
            return self.reply_error(GpErrorCode::NotLoggedIn, "Not logged in");
        };
        if !self.friends.registry().is_owned_by(id, self.id).await {
            info!("GPCM:{}: Connection {} was superseded", id, self.id);
            self.profile_id = None;
            return self.reply_error(GpErrorCode::NotLoggedIn, "Logged in elsewhere");
        }

        let result = match command.command.as_str() {
            "addbuddy" => match parse_profile_id(&command, "newprofileid") {
                Some(target) => self.friends.add_friend(id, target).await,
                None => return self.reply_error(GpErrorCode::AddFriend, "Invalid profile id"),
            },
            "delbuddy" => match parse_profile_id(&command, "delprofileid") {
                Some(target) => self.friends.remove_friend(id, target).await.map(|_| ()),
                None => return self.reply_error(GpErrorCode::DeleteFriend, "Invalid profile id"),
            },
            "authadd" => match parse_profile_id(&command, "fromprofileid") {
                Some(from) => self.friends.auth_add_friend(id, from).await,
                None => return self.reply_error(GpErrorCode::AuthAddBadFrom, "Invalid profile id"),
            },
            "status" => {
                let stat_string = command.get("statstring").unwrap_or_default();
                let loc_string = command.get("locstring").unwrap_or_default();
                self.friends
                    .set_status(id, &command.value, stat_string, loc_string)
                    .await
                    .map(|_| ())
            }
            "bm" => {
                if command.value != MessageKind::Direct.as_str() {
                    info!("GPCM:{}: Ignoring message type {:?}", id, command.value);
                    return Disposition::Continue;
                }
                match parse_profile_id(&command, "t") {
                    Some(target) => {
                        self.friends
                            .bestie_message(id, &command.value, target, command.get("msg"))
                            .await
                    }
                    None => return self.reply_error(GpErrorCode::Message, "Invalid profile id"),
                }
            }
            other => {
                info!("GPCM:{}: Unhandled command {:?}", id, other);
                Ok(())
            }
        };

        match result {
            Ok(()) => Disposition::Continue,
            Err(e) => self.reply_friend_error(&command.command, &e),
        }
    }

    /// Tear down: drop the session and tell mutual friends, unless a newer
    /// connection has taken over the profile.
    pub async fn close(&mut self) {
        if let Some(id) = self.profile_id.take() {
            self.friends.logout(id, self.id).await;
        }
    }

    async fn login(&mut self, command: &GameSpyCommand) -> Disposition {
        let token = command.get("authtoken").unwrap_or_default();
        let profile = match self.directory.authenticate(token) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("GPCM: Login from {} rejected: {}", self.transport.remote_addr(), e);
                return self.reply_error(GpErrorCode::LoginServerAuthFailed, "Invalid authentication token");
            }
        };

        if let Some(previous) = self.profile_id.filter(|&id| id != profile.profile_id) {
            self.friends.logout(previous, self.id).await;
        }

        if let Some(superseded) = self
            .friends
            .registry()
            .login(&profile, self.id, self.transport.clone())
            .await
        {
            info!(
                "GPCM:{}: Superseded connection {} from {}",
                profile.profile_id,
                superseded.connection,
                superseded.transport.remote_addr()
            );
        }

        self.profile_id = Some(profile.profile_id);
        info!(
            "GPCM:{}: Logged in as {:?} from {}",
            profile.profile_id,
            profile.unique_nick,
            self.transport.remote_addr()
        );

        let reply = GameSpyCommand::new("lc", "2")
            .with("sesskey", random_session_key().to_string())
            .with("proof", "0")
            .with("userid", profile.user_id.to_string())
            .with("profileid", profile.profile_id.to_string())
            .with("uniquenick", profile.unique_nick.as_str())
            .with("lt", random_alphanumeric(22))
            .with("id", "1");
        self.write(&reply);

        Disposition::Continue
    }

    fn reply_friend_error(&self, command: &str, err: &FriendError) -> Disposition {
        let code = err.code(command);
        if let Some(id) = self.profile_id {
            warn!("GPCM:{}: {} failed: {}", id, command, err);
        }
        self.reply_error(code, &err.to_string())
    }

    fn reply_error(&self, code: GpErrorCode, message: &str) -> Disposition {
        self.write(&error_frame(code, message));
        if code.is_fatal() {
            Disposition::Close
        } else {
            Disposition::Continue
        }
    }

    fn write(&self, frame: &GameSpyCommand) {
        if let Err(e) = self.transport.write(frame.encode().as_bytes()) {
            warn!("GPCM: Write to {} failed: {}", self.transport.remote_addr(), e);
        }
    }
}

fn parse_profile_id(command: &GameSpyCommand, key: &str) -> Option<ProfileId> {
    command.get(key)?.parse().ok()
}

/// The presence server.
pub struct PresenceServer {
    config: PresenceConfig,
    listener: TcpListener,
    friends: Arc<FriendService>,
    directory: Arc<dyn ProfileDirectory>,
    next_connection: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl PresenceServer {
    /// Bind the TCP listener.
    pub async fn bind(
        config: PresenceConfig,
        directory: Arc<dyn ProfileDirectory>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let registry = Arc::new(PresenceRegistry::new(config.friend_list_limit));
        let friends = Arc::new(FriendService::new(registry, Arc::new(DwcMatchCodec)));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            friends,
            directory,
            next_connection: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Friend engine and its registry.
    pub fn friends(&self) -> Arc<FriendService> {
        self.friends.clone()
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("Presence server listening on {}", self.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let friends = self.friends.clone();
        let directory = self.directory.clone();
        let queue = self.config.outbound_queue.max(1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(queue);

            let writer_task = tokio::spawn(async move {
                while let Some(bytes) = out_rx.recv().await {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                let _ = writer.shutdown().await;
            });

            let transport: Arc<dyn Transport> = Arc::new(ChannelTransport::new(out_tx, addr));
            let mut connection = Connection::new(id, transport, friends, directory);
            connection.greet();

            let mut pending = Vec::new();
            let mut chunk = vec![0u8; 4096];

            'read: loop {
                tokio::select! {
                    result = reader.read(&mut chunk) => {
                        match result {
                            Ok(0) => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Ok(n) => pending.extend_from_slice(&chunk[..n]),
                            Err(e) => {
                                debug!("Read error from {}: {}", addr, e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }

                while let Some(frame) = take_frame(&mut pending) {
                    if connection.handle_frame(&frame).await == Disposition::Close {
                        break 'read;
                    }
                }

                if pending.len() > MAX_PENDING_BYTES {
                    warn!("Client {} sent {} bytes without a frame terminator", addr, pending.len());
                    break;
                }
            }

            connection.close().await;
            drop(connection);

            // The writer exits once every transport handle is gone.
            let mut writer_task = writer_task;
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task).await.is_err() {
                debug!("Gave up flushing frames to {}", addr);
                writer_task.abort();
            }
            info!("Client {} cleaned up", addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
