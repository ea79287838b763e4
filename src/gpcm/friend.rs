//! Friend & Presence Engine
//!
//! Every operation runs under the presence registry lock, so checking the
//! other side of a relationship and updating this side happen atomically with
//! respect to the other side doing the same.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{legacy_signed_ip, random_hex_string};
use crate::gpcm::error::{FriendError, MessageError};
use crate::gpcm::match_command::{parse_match_message, MatchCommandCodec};
use crate::gpcm::relay::MessageKind;
use crate::gpcm::session::{ConnectionId, PresenceRegistry, ProfileId, SessionMap};

/// Length of the random nonce in a mutual-friend notice.
const NOTICE_NONCE_LEN: usize = 32;

/// Legacy status string.
pub fn status_string(status: &str, stat_string: &str, loc_string: &str, signed_ip: i32) -> String {
    format!(
        "|s|{}|ss|{}|ls|{}|ip|{}|p|0|qm|0",
        status, stat_string, loc_string, signed_ip
    )
}

/// Status broadcast when a client disconnects.
pub fn offline_status(signed_ip: i32) -> String {
    status_string("0", "Offline", "", signed_ip)
}

/// Friend-list, status and message operations over a [`PresenceRegistry`].
pub struct FriendService {
    registry: Arc<PresenceRegistry>,
    codec: Arc<dyn MatchCommandCodec>,
}

impl FriendService {
    /// Create a service over a registry.
    pub fn new(registry: Arc<PresenceRegistry>, codec: Arc<dyn MatchCommandCodec>) -> Self {
        Self { registry, codec }
    }

    /// Underlying registry.
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// `addbuddy`: add `target` to `id`'s friend list, promoting to mutual if
    /// the target already added `id`.
    pub async fn add_friend(&self, id: ProfileId, target: ProfileId) -> Result<(), FriendError> {
        let mut sessions = self.registry.write().await;

        let requester = sessions.get_mut(&id).ok_or(FriendError::NotLoggedIn(id))?;
        if requester.last_name.is_empty() {
            warn!("GPCM:{}: Add friend without last name", id);
            return Err(FriendError::IncompleteProfile);
        }
        if target == id {
            warn!("GPCM:{}: Attempt to add self as friend", id);
            return Err(FriendError::SelfTarget);
        }

        info!("GPCM:{}: Add friend {}", id, target);

        // The client re-sends this on every login; not an error.
        if requester.is_friend_authorized(target) {
            debug!("GPCM:{}: {} is already authorized", id, target);
            return Ok(());
        }

        requester
            .friend_list
            .insert(target)
            .map_err(|_| FriendError::ListFull(requester.friend_list.limit()))?;

        match PresenceRegistry::online(&sessions, target) {
            None => {
                info!("GPCM:{}: Destination {} is not online", id, target);
                return Ok(());
            }
            Some(other) if !other.is_friend_added(id) => {
                info!("GPCM:{}: Destination {} has not added sender", id, target);
                return Ok(());
            }
            Some(_) => {}
        }

        promote_mutual(&mut sessions, id, target);

        if let Some(other) = sessions.get(&target) {
            let notice = format!("\r\n\r\n|signed|{}", random_hex_string(NOTICE_NONCE_LEN));
            other.send(MessageKind::MutualNotice, id, &notice);
        }
        info!("GPCM:{}: Now mutual friends with {}", id, target);
        Ok(())
    }

    /// `delbuddy`: drop `target` from both of `id`'s lists. The friendship is
    /// no longer mutual, so `id` also leaves the target's authorized list.
    /// Returns whether anything was removed.
    pub async fn remove_friend(&self, id: ProfileId, target: ProfileId) -> Result<bool, FriendError> {
        let mut sessions = self.registry.write().await;
        let session = sessions.get_mut(&id).ok_or(FriendError::NotLoggedIn(id))?;

        let added = session.friend_list.remove(target);
        let authorized = session.auth_friend_list.remove(target);
        if let Some(other) = sessions.get_mut(&target) {
            other.auth_friend_list.remove(id);
        }
        info!("GPCM:{}: Remove friend {} (present: {})", id, target, added || authorized);
        Ok(added || authorized)
    }

    /// `authadd`: acknowledge `from`'s request and exchange statuses if the
    /// two profiles list each other.
    pub async fn auth_add_friend(&self, id: ProfileId, from: ProfileId) -> Result<(), FriendError> {
        let sessions = self.registry.write().await;
        if !sessions.contains_key(&id) {
            return Err(FriendError::NotLoggedIn(id));
        }

        info!("GPCM:{}: Authorize friend {}", id, from);
        match PresenceRegistry::online(&sessions, from) {
            Some(other) => {
                other.send(MessageKind::AuthAck, id, "");
            }
            None => info!("GPCM:{}: Destination {} is not online", id, from),
        }

        exchange_friend_status(&sessions, id, from);
        Ok(())
    }

    /// `status`: store the new status string and push it to every friend who
    /// lists this profile back. Returns the stored string.
    pub async fn set_status(
        &self,
        id: ProfileId,
        status: &str,
        stat_string: &str,
        loc_string: &str,
    ) -> Result<String, FriendError> {
        let mut sessions = self.registry.write().await;
        let session = sessions.get_mut(&id).ok_or(FriendError::NotLoggedIn(id))?;

        let ip = legacy_signed_ip(&session.transport.remote_addr())?;
        let encoded = status_string(status, stat_string, loc_string, ip);
        info!("GPCM:{}: New status: {}", id, encoded);

        session.status = encoded.clone();
        session.loc_string = loc_string.to_string();

        let sessions = &*sessions;
        if let Some(session) = sessions.get(&id) {
            for friend in session.friend_list.iter() {
                send_friend_status(sessions, id, friend);
            }
        }
        Ok(encoded)
    }

    /// `bm`: validate a match message and relay it verbatim to `target`.
    pub async fn bestie_message(
        &self,
        id: ProfileId,
        kind: &str,
        target: ProfileId,
        msg: Option<&str>,
    ) -> Result<(), FriendError> {
        if kind != MessageKind::Direct.as_str() {
            info!("GPCM:{}: Ignoring message type {:?}", id, kind);
            return Ok(());
        }

        {
            let sessions = self.registry.read().await;
            let sender = sessions.get(&id).ok_or(FriendError::NotLoggedIn(id))?;
            if !sender.is_friend_added(target) {
                warn!("GPCM:{}: {} is not on sender's friend list", id, target);
                return Err(FriendError::NotOnSenderList(target));
            }
        }

        let msg = match msg {
            Some(msg) if !msg.is_empty() => msg,
            _ => return Err(MessageError::Missing.into()),
        };
        let command = parse_match_message(msg, self.codec.as_ref()).map_err(|e| {
            warn!("GPCM:{}: Invalid match message to {}: {}", id, target, e);
            e
        })?;
        debug!("GPCM:{}: Match command to {}: {:?}", id, target, command);

        let sessions = self.registry.read().await;
        let recipient =
            PresenceRegistry::online(&sessions, target).ok_or(FriendError::FriendOffline(target))?;
        if !recipient.is_friend_added(id) {
            warn!("GPCM:{}: {} is not friends with sender", id, target);
            return Err(FriendError::NotOnTargetList(target));
        }

        recipient.send(MessageKind::Direct, id, msg);
        Ok(())
    }

    /// Disconnect: remove the session if `connection` still owns it and tell
    /// mutual friends it went offline. Returns whether a session was removed.
    pub async fn logout(&self, id: ProfileId, connection: ConnectionId) -> bool {
        let mut sessions = self.registry.write().await;
        let Some(session) = PresenceRegistry::take_owned(&mut sessions, id, connection) else {
            debug!("GPCM:{}: Connection {} no longer owns the session", id, connection);
            return false;
        };
        info!("GPCM:{}: Logged out", id);

        let ip = match legacy_signed_ip(&session.transport.remote_addr()) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("GPCM:{}: Skipping offline status: {}", id, e);
                return true;
            }
        };

        let offline = offline_status(ip);
        for friend in session.auth_friend_list.iter() {
            if let Some(other) = PresenceRegistry::online(&sessions, friend) {
                other.send(MessageKind::Status, id, &offline);
            }
        }
        true
    }
}

fn promote_mutual(sessions: &mut SessionMap, a: ProfileId, b: ProfileId) {
    for (owner, friend) in [(a, b), (b, a)] {
        if let Some(session) = sessions.get_mut(&owner) {
            // Authorized ids are always on the friend list, so this only fails
            // if the list was shrunk underneath us.
            if session.auth_friend_list.insert(friend).is_err() {
                warn!("GPCM:{}: Authorized list full, {} not recorded", owner, friend);
            }
        }
    }
}

/// Send `from`'s status to `to` if both list each other and `to` is online.
fn send_friend_status(sessions: &SessionMap, from: ProfileId, to: ProfileId) {
    let Some(sender) = sessions.get(&from) else {
        return;
    };
    if !sender.is_friend_added(to) {
        return;
    }
    if let Some(recipient) = PresenceRegistry::online(sessions, to) {
        if recipient.is_friend_added(from) {
            recipient.send(MessageKind::Status, from, &sender.status);
        }
    }
}

fn exchange_friend_status(sessions: &SessionMap, a: ProfileId, b: ProfileId) {
    let (Some(left), Some(right)) = (sessions.get(&a), PresenceRegistry::online(sessions, b)) else {
        return;
    };
    if left.is_friend_added(b) && right.is_friend_added(a) {
        right.send(MessageKind::Status, a, &left.status);
        left.send(MessageKind::Status, b, &right.status);
    }
}
