//! Account Directory
//!
//! Login tickets are issued by the account service and redeemed here by the
//! presence login. Persistent storage lives elsewhere; [`MemoryDirectory`]
//! keeps everything in memory and can be seeded from a JSON file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::core::rng::{random_alphanumeric, random_hex_string};

/// Profile attributes the presence engine needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Account identifier.
    pub user_id: u64,
    /// Presence profile identifier.
    pub profile_id: u32,
    /// Last name; empty for incomplete profiles.
    #[serde(default)]
    pub last_name: String,
    /// Unique nick.
    #[serde(default)]
    pub unique_nick: String,
}

/// A freshly issued login ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Opaque ticket the client presents at login.
    pub token: String,
    /// Challenge bound to the ticket.
    pub challenge: String,
}

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Ticket unknown or already redeemed.
    #[error("unknown login ticket")]
    UnknownToken,
    /// No profile for the user.
    #[error("no profile for user {0}")]
    UnknownUser(u64),
    /// Directory state unusable.
    #[error("directory unavailable")]
    Unavailable,
    /// Seed file unreadable.
    #[error("failed to read profiles: {0}")]
    Io(#[from] std::io::Error),
    /// Seed file malformed.
    #[error("failed to parse profiles: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolves login tickets to profiles.
pub trait ProfileDirectory: Send + Sync {
    /// Redeem a login ticket.
    fn authenticate(&self, token: &str) -> Result<UserProfile, DirectoryError>;
}

/// Issues login tickets.
pub trait TokenIssuer: Send + Sync {
    /// Issue a ticket for `user_id` playing `game_code`.
    fn issue_token(&self, user_id: u64, game_code: &str) -> Result<IssuedToken, DirectoryError>;
}

struct TicketGrant {
    user_id: u64,
    game_code: String,
}

/// In-memory profile store and ticket issuer.
#[derive(Default)]
pub struct MemoryDirectory {
    profiles: Mutex<BTreeMap<u64, UserProfile>>,
    tickets: Mutex<BTreeMap<String, TicketGrant>>,
}

impl MemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory seeded from a JSON array of profiles.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let directory = Self::from_json(&text)?;
        info!(
            "Loaded {} profiles from {}",
            directory.profile_count(),
            path.as_ref().display()
        );
        Ok(directory)
    }

    /// Directory seeded from JSON text.
    pub fn from_json(text: &str) -> Result<Self, DirectoryError> {
        let profiles: Vec<UserProfile> = serde_json::from_str(text)?;
        let directory = Self::new();
        for profile in profiles {
            directory.insert_profile(profile)?;
        }
        Ok(directory)
    }

    /// Add or replace a profile.
    pub fn insert_profile(&self, profile: UserProfile) -> Result<(), DirectoryError> {
        let mut profiles = self.profiles.lock().map_err(|_| DirectoryError::Unavailable)?;
        profiles.insert(profile.user_id, profile);
        Ok(())
    }

    /// Number of profiles.
    pub fn profile_count(&self) -> usize {
        self.profiles.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl TokenIssuer for MemoryDirectory {
    fn issue_token(&self, user_id: u64, game_code: &str) -> Result<IssuedToken, DirectoryError> {
        if !self
            .profiles
            .lock()
            .map_err(|_| DirectoryError::Unavailable)?
            .contains_key(&user_id)
        {
            return Err(DirectoryError::UnknownUser(user_id));
        }

        let issued = IssuedToken {
            token: format!("NDS{}", random_hex_string(96)),
            challenge: random_alphanumeric(8),
        };

        let mut tickets = self.tickets.lock().map_err(|_| DirectoryError::Unavailable)?;
        tickets.insert(
            issued.token.clone(),
            TicketGrant {
                user_id,
                game_code: game_code.to_string(),
            },
        );
        Ok(issued)
    }
}

impl ProfileDirectory for MemoryDirectory {
    fn authenticate(&self, token: &str) -> Result<UserProfile, DirectoryError> {
        let grant = self
            .tickets
            .lock()
            .map_err(|_| DirectoryError::Unavailable)?
            .remove(token)
            .ok_or(DirectoryError::UnknownToken)?;

        let profiles = self.profiles.lock().map_err(|_| DirectoryError::Unavailable)?;
        let profile = profiles
            .get(&grant.user_id)
            .cloned()
            .ok_or(DirectoryError::UnknownUser(grant.user_id))?;

        info!(
            "Redeemed ticket for user {} (profile {}, game {:?})",
            grant.user_id, profile.profile_id, grant.game_code
        );
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> MemoryDirectory {
        MemoryDirectory::from_json(
            r#"[
                {"user_id": 1, "profile_id": 100, "last_name": "Mario", "unique_nick": "m1"},
                {"user_id": 2, "profile_id": 200}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_seed_defaults_missing_fields() {
        let directory = directory();
        assert_eq!(directory.profile_count(), 2);

        let ticket = directory.issue_token(2, "RMCJ").unwrap();
        let profile = directory.authenticate(&ticket.token).unwrap();
        assert_eq!(profile.profile_id, 200);
        assert!(profile.last_name.is_empty());
    }

    #[test]
    fn test_ticket_is_single_use() {
        let directory = directory();
        let ticket = directory.issue_token(1, "RMCJ").unwrap();
        assert!(ticket.token.starts_with("NDS"));
        assert_eq!(ticket.challenge.len(), 8);

        assert_eq!(directory.authenticate(&ticket.token).unwrap().profile_id, 100);
        assert!(matches!(
            directory.authenticate(&ticket.token),
            Err(DirectoryError::UnknownToken)
        ));
    }

    #[test]
    fn test_issue_for_unknown_user() {
        assert!(matches!(
            directory().issue_token(99, "RMCJ"),
            Err(DirectoryError::UnknownUser(99))
        ));
    }

    #[test]
    fn test_malformed_seed() {
        assert!(matches!(MemoryDirectory::from_json("{"), Err(DirectoryError::Parse(_))));
    }
}
