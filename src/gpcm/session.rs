//! Presence Session Registry
//!
//! One session per logged-in profile. The registry lock also guards every
//! session's friend lists, so the friend engine can check both sides of a
//! relationship and update them in a single critical section.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::gpcm::directory::UserProfile;
use crate::gpcm::relay::{send_message, MessageKind, Transport};

/// Platform-assigned profile identifier.
pub type ProfileId = u32;

/// Identifies one TCP connection, so a stale connection cannot log out a
/// newer session for the same profile.
pub type ConnectionId = u64;

/// Friend list is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("friend list full")]
pub struct FriendListFull;

/// Ordered, duplicate-free, capacity-bounded list of profile ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendList {
    ids: Vec<ProfileId>,
    limit: usize,
}

impl FriendList {
    /// Empty list holding at most `limit` ids.
    pub fn new(limit: usize) -> Self {
        Self { ids: Vec::new(), limit }
    }

    /// Linear membership test; lists are small.
    pub fn contains(&self, id: ProfileId) -> bool {
        self.ids.contains(&id)
    }

    /// Append `id`. Returns `Ok(false)` if it was already present.
    pub fn insert(&mut self, id: ProfileId) -> Result<bool, FriendListFull> {
        if self.contains(id) {
            return Ok(false);
        }
        if self.ids.len() >= self.limit {
            return Err(FriendListFull);
        }
        self.ids.push(id);
        Ok(true)
    }

    /// Remove `id`. Returns whether it was present.
    pub fn remove(&mut self, id: ProfileId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|&stored| stored != id);
        self.ids.len() != before
    }

    /// Ids in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = ProfileId> + '_ {
        self.ids.iter().copied()
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Capacity.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// A logged-in presence client.
pub struct PresenceSession {
    /// Profile identifier.
    pub profile_id: ProfileId,
    /// Owning connection.
    pub connection: ConnectionId,
    /// Write side of the client connection.
    pub transport: Arc<dyn Transport>,
    /// Login state.
    pub logged_in: bool,
    /// Profile last name; required to originate friend requests.
    pub last_name: String,
    /// Profile unique nick.
    pub unique_nick: String,
    /// Profiles this session has added.
    pub friend_list: FriendList,
    /// Profiles confirmed mutual.
    pub auth_friend_list: FriendList,
    /// Encoded status string (`|s|..|ss|..|ls|..|ip|..|p|0|qm|0`).
    pub status: String,
    /// Location string from the last status update.
    pub loc_string: String,
}

impl PresenceSession {
    /// New session for a freshly authenticated profile.
    pub fn new(
        profile: &UserProfile,
        connection: ConnectionId,
        transport: Arc<dyn Transport>,
        friend_list_limit: usize,
    ) -> Self {
        Self {
            profile_id: profile.profile_id,
            connection,
            transport,
            logged_in: true,
            last_name: profile.last_name.clone(),
            unique_nick: profile.unique_nick.clone(),
            friend_list: FriendList::new(friend_list_limit),
            auth_friend_list: FriendList::new(friend_list_limit),
            status: String::new(),
            loc_string: String::new(),
        }
    }

    /// Whether this session has added `id`.
    pub fn is_friend_added(&self, id: ProfileId) -> bool {
        self.friend_list.contains(id)
    }

    /// Whether `id` is a confirmed mutual friend.
    pub fn is_friend_authorized(&self, id: ProfileId) -> bool {
        self.auth_friend_list.contains(id)
    }

    /// Relay a `bm` frame to this session.
    pub fn send(&self, kind: MessageKind, from: ProfileId, msg: &str) -> bool {
        send_message(self.transport.as_ref(), kind, from, msg)
    }
}

impl std::fmt::Debug for PresenceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSession")
            .field("profile_id", &self.profile_id)
            .field("connection", &self.connection)
            .field("remote", &self.transport.remote_addr())
            .field("logged_in", &self.logged_in)
            .field("friend_list", &self.friend_list)
            .field("auth_friend_list", &self.auth_friend_list)
            .field("status", &self.status)
            .finish()
    }
}

/// Session map type guarded by the registry lock.
pub type SessionMap = BTreeMap<ProfileId, PresenceSession>;

/// Concurrent store of presence sessions.
pub struct PresenceRegistry {
    sessions: RwLock<SessionMap>,
    friend_list_limit: usize,
}

impl PresenceRegistry {
    /// Create an empty registry.
    pub fn new(friend_list_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            friend_list_limit,
        }
    }

    /// Register a login. A previous session for the same profile is replaced
    /// and returned.
    pub async fn login(
        &self,
        profile: &UserProfile,
        connection: ConnectionId,
        transport: Arc<dyn Transport>,
    ) -> Option<PresenceSession> {
        let session = PresenceSession::new(profile, connection, transport, self.friend_list_limit);
        self.sessions.write().await.insert(profile.profile_id, session)
    }

    /// Remove a profile's session if it still belongs to `connection`.
    pub async fn logout(&self, id: ProfileId, connection: ConnectionId) -> Option<PresenceSession> {
        let mut sessions = self.sessions.write().await;
        Self::take_owned(&mut sessions, id, connection)
    }

    /// Lock-held variant of [`logout`](Self::logout).
    pub(crate) fn take_owned(
        sessions: &mut SessionMap,
        id: ProfileId,
        connection: ConnectionId,
    ) -> Option<PresenceSession> {
        match sessions.get(&id) {
            Some(session) if session.connection == connection => sessions.remove(&id),
            _ => None,
        }
    }

    /// Whether a profile has a logged-in session.
    pub async fn is_online(&self, id: ProfileId) -> bool {
        let sessions = self.sessions.read().await;
        Self::online(&sessions, id).is_some()
    }

    /// Whether `connection` still owns the session for `id`.
    pub async fn is_owned_by(&self, id: ProfileId, connection: ConnectionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&id)
            .is_some_and(|s| s.connection == connection)
    }

    /// Logged-in session for `id`, under an already-held lock.
    pub(crate) fn online(sessions: &SessionMap, id: ProfileId) -> Option<&PresenceSession> {
        sessions.get(&id).filter(|s| s.logged_in)
    }

    /// Whether `owner` has added `friend`.
    pub async fn is_friend_added(&self, owner: ProfileId, friend: ProfileId) -> bool {
        self.sessions
            .read()
            .await
            .get(&owner)
            .is_some_and(|s| s.is_friend_added(friend))
    }

    /// Whether `owner` has `friend` as a confirmed mutual friend.
    pub async fn is_friend_authorized(&self, owner: ProfileId, friend: ProfileId) -> bool {
        self.sessions
            .read()
            .await
            .get(&owner)
            .is_some_and(|s| s.is_friend_authorized(friend))
    }

    /// Snapshot of a session's friend lists: `(friend_list, auth_friend_list)`.
    pub async fn friend_lists(&self, id: ProfileId) -> Option<(Vec<ProfileId>, Vec<ProfileId>)> {
        self.sessions.read().await.get(&id).map(|s| {
            (
                s.friend_list.iter().collect(),
                s.auth_friend_list.iter().collect(),
            )
        })
    }

    /// Current status string.
    pub async fn status(&self, id: ProfileId) -> Option<String> {
        self.sessions.read().await.get(&id).map(|s| s.status.clone())
    }

    /// Number of sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Shared access for multi-step reads.
    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().await
    }

    /// Exclusive access for multi-step mutations.
    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().await
    }
}
