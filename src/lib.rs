//! # DWC Relay
//!
//! Matchmaking heartbeat and presence relay services for legacy DWC game
//! clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         DWC RELAY                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Shared protocol primitives             │
//! │  ├── gamespy.rs     - \key\value\final\ text codec           │
//! │  ├── encoding.rs    - Platform base64 alphabet               │
//! │  ├── addr.rs        - Legacy IPv4 formatting                 │
//! │  └── rng.rs         - Challenges, nonces, session keys       │
//! │                                                              │
//! │  qr2/               - Matchmaking (UDP)                      │
//! │  ├── protocol.rs    - Datagram framing, heartbeat payload    │
//! │  ├── session.rs     - Session registry                       │
//! │  └── server.rs      - Listener, dispatcher, expiry reaper    │
//! │                                                              │
//! │  gpcm/              - Presence (TCP)                         │
//! │  ├── session.rs     - Presence registry, friend lists        │
//! │  ├── friend.rs      - Friend, status and message engine      │
//! │  ├── relay.rs       - bm frames and the transport seam       │
//! │  ├── match_command.rs - vMAT message validation              │
//! │  ├── directory.rs   - Login tickets and profiles             │
//! │  ├── error.rs       - Legacy error codes                     │
//! │  └── server.rs      - Listener and command dispatch          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Each service owns one registry behind one `RwLock`. Multi-step sequences
//! (check the other side, then update this side) run under a single write
//! guard, so two clients adding each other at the same moment still end up
//! with exactly one mutual promotion.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod gpcm;
pub mod qr2;

// Re-export commonly used types
pub use crate::config::Config;
pub use crate::core::{AddressError, CodecError, GameSpyCommand};
pub use crate::gpcm::{FriendService, MemoryDirectory, PresenceConfig, PresenceRegistry, PresenceServer};
pub use crate::qr2::{MatchmakingConfig, MatchmakingServer, SessionRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
