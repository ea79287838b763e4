//! Shared protocol primitives.
//!
//! Nothing in here knows about sessions; both services build on these.

pub mod addr;
pub mod encoding;
pub mod gamespy;
pub mod rng;

// Re-export core types
pub use addr::{legacy_signed_ip, AddressError};
pub use gamespy::{CodecError, GameSpyCommand};
pub use rng::{random_alphanumeric, random_hex_string};
