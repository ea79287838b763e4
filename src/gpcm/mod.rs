//! Presence Service
//!
//! Persistent TCP connections carrying GameSpy text frames. A client logs in
//! with a ticket from the account service, then manages its friend list,
//! publishes status and relays match messages to mutual friends.
//!
//! A friendship is mutual once both profiles have added each other:
//!
//! ```text
//! 100 addbuddy 200            200 addbuddy 100
//! friend_list(100) = [200]    friend_list(200) = [100]
//!                             auth lists updated on both sides,
//!                             100 receives bm 2 (mutual notice)
//! ```

pub mod directory;
pub mod error;
pub mod friend;
pub mod match_command;
pub mod relay;
pub mod server;
pub mod session;

pub use directory::{IssuedToken, MemoryDirectory, ProfileDirectory, TokenIssuer, UserProfile};
pub use error::{FriendError, GpErrorCode, MessageError};
pub use friend::FriendService;
pub use match_command::{DwcMatchCodec, MatchCommand, MatchCommandCodec};
pub use relay::{ChannelTransport, MessageKind, RelayError, Transport};
pub use server::{Connection, Disposition, PresenceConfig, PresenceServer};
pub use session::{ConnectionId, FriendList, PresenceRegistry, PresenceSession, ProfileId};
