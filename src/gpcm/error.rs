//! Presence Protocol Errors
//!
//! Failures are reported to the client as a GameSpy `error` frame carrying a
//! legacy numeric code. The client picks its on-screen reason from the code,
//! so the mapping below is part of the wire contract.

use thiserror::Error;

use crate::core::gamespy::GameSpyCommand;
use crate::core::AddressError;

/// Legacy GameSpy error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum GpErrorCode {
    /// Generic failure.
    General = 0x0000,
    /// Frame could not be parsed.
    Parse = 0x0001,
    /// Command requires a login first.
    NotLoggedIn = 0x0002,
    /// Login ticket rejected.
    LoginServerAuthFailed = 0x0108,
    /// Add-friend failed.
    AddFriend = 0x0600,
    /// Requester's profile is incomplete.
    AddFriendBadFrom = 0x0601,
    /// Target profile is invalid (e.g. the requester itself).
    AddFriendBadNew = 0x0602,
    /// Target already a mutual friend.
    AddFriendAlreadyFriends = 0x0603,
    /// Authorize-friend failed.
    AuthAdd = 0x0700,
    /// Malformed `fromprofileid`.
    AuthAddBadFrom = 0x0701,
    /// Status update failed.
    Status = 0x0800,
    /// Message relay failed.
    Message = 0x0900,
    /// Recipient does not have a friendship with the sender.
    MessageNotFriends = 0x0901,
    /// Recipient is offline.
    MessageFriendOffline = 0x0903,
    /// Delete-friend failed.
    DeleteFriend = 0x0B00,
}

impl GpErrorCode {
    /// Numeric wire value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Whether the client should drop the connection.
    pub fn is_fatal(self) -> bool {
        matches!(self, GpErrorCode::LoginServerAuthFailed | GpErrorCode::NotLoggedIn)
    }
}

/// Friend and presence operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FriendError {
    /// Requester has no registry entry.
    #[error("profile {0} is not logged in")]
    NotLoggedIn(u32),
    /// Requester's profile lacks a last name.
    #[error("profile has no last name")]
    IncompleteProfile,
    /// Requester targeted itself.
    #[error("cannot add self as friend")]
    SelfTarget,
    /// Friend list is at capacity.
    #[error("friend list is full ({0} entries)")]
    ListFull(usize),
    /// Target absent from the sender's friend list.
    #[error("{0} is not on the sender's friend list")]
    NotOnSenderList(u32),
    /// Sender absent from the target's friend list.
    #[error("{0} has not added the sender")]
    NotOnTargetList(u32),
    /// Target offline.
    #[error("{0} is not online")]
    FriendOffline(u32),
    /// Relayed message failed validation.
    #[error("invalid message: {0}")]
    Message(#[from] MessageError),
    /// Peer address could not be expressed in the legacy format.
    #[error("status address: {0}")]
    Address(#[from] AddressError),
}

impl FriendError {
    /// Wire code for an error raised while handling `command`.
    pub fn code(&self, command: &str) -> GpErrorCode {
        match self {
            FriendError::NotLoggedIn(_) => GpErrorCode::NotLoggedIn,
            FriendError::IncompleteProfile => GpErrorCode::AddFriendBadFrom,
            FriendError::SelfTarget => GpErrorCode::AddFriendBadNew,
            FriendError::ListFull(_) => GpErrorCode::AddFriend,
            FriendError::NotOnSenderList(_) | FriendError::NotOnTargetList(_) => {
                GpErrorCode::MessageNotFriends
            }
            FriendError::FriendOffline(_) => GpErrorCode::MessageFriendOffline,
            FriendError::Message(_) => GpErrorCode::Message,
            FriendError::Address(_) => match command {
                "status" => GpErrorCode::Status,
                _ => GpErrorCode::General,
            },
        }
    }
}

/// Relayed match-message framing errors. All map to one generic wire code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// No `msg` field.
    #[error("missing message body")]
    Missing,
    /// Body does not start with `GPCM`.
    #[error("bad prefix")]
    Prefix,
    /// `vMAT` marker missing or misplaced, or length class invalid.
    #[error("bad header")]
    Header,
    /// Payload is not DWC base64.
    #[error("bad base64 payload")]
    Base64,
    /// Match-command codec rejected the payload.
    #[error("bad match command 0x{0:02x}")]
    Command(u8),
}

/// Build the `\error\` frame for a code.
pub fn error_frame(code: GpErrorCode, message: &str) -> GameSpyCommand {
    let mut frame = GameSpyCommand::new("error", "").with("err", code.code().to_string());
    if code.is_fatal() {
        frame = frame.with("fatal", "");
    }
    frame.with("errmsg", message).with("id", "1")
}
