//! Matchmaking Service
//!
//! UDP heartbeat protocol: clients report session metadata, answer a
//! challenge once, and then keep the session alive until they shut it down.
//!
//! ```text
//! Unknown --heartbeat--> Unauthenticated --challenge sent--> ChallengePending
//!                                                                 |
//!                                              CHALLENGE received |
//!                                                                 v
//!          (removed) <--statechanged=2-- ... <-- Authenticated <--+
//! ```

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{Command, DatagramError, Heartbeat, StateChange};
pub use server::{process_datagram, MatchmakingConfig, MatchmakingServer, ServerError};
pub use session::{HeartbeatOutcome, MatchmakingSession, SessionId, SessionRegistry, SessionState};
