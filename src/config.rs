//! Service Configuration
//!
//! Every knob has a default and an environment override.

use std::str::FromStr;
use tracing::warn;

use crate::gpcm::server::PresenceConfig;
use crate::qr2::server::MatchmakingConfig;

/// Configuration for both services.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Matchmaking (UDP) service.
    pub matchmaking: MatchmakingConfig,
    /// Presence (TCP) service.
    pub presence: PresenceConfig,
}

impl Config {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            matchmaking: MatchmakingConfig::from_env(),
            presence: PresenceConfig::from_env(),
        }
    }
}

/// Parse an environment variable, ignoring (and logging) malformed values.
pub(crate) fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring malformed {}={:?}", key, raw);
            None
        }
    }
}
