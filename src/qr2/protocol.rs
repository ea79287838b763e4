//! Matchmaking Datagram Format
//!
//! Every request is a single UDP datagram:
//!
//! ```text
//! +---------+-------------------+-----------------------+
//! | cmd (1) | session id (4 BE) | payload (cmd-defined) |
//! +---------+-------------------+-----------------------+
//! ```
//!
//! Replies start with `FE FD <cmd> <session id (4 BE)>`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;

use crate::core::addr::{self, AddressError};

/// Magic prefix of every server reply.
pub const RESPONSE_MAGIC: [u8; 2] = [0xFE, 0xFD];

/// Offset of the payload inside a datagram.
pub const PAYLOAD_OFFSET: usize = 5;

/// Matchmaking command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Server-browser query.
    Query = 0x00,
    /// Challenge response from the client.
    Challenge = 0x01,
    /// Echo request.
    Echo = 0x02,
    /// Session heartbeat with key/value report.
    Heartbeat = 0x03,
    /// Error report.
    AddError = 0x04,
    /// Echo reply.
    EchoResponse = 0x05,
    /// Client-to-client message.
    ClientMessage = 0x06,
    /// Client message acknowledgement.
    ClientMessageAck = 0x07,
    /// Liveness signal.
    KeepAlive = 0x08,
    /// Service availability probe.
    Available = 0x09,
    /// Registration confirmation (server reply).
    ClientRegistered = 0x0A,
}

impl Command {
    /// Protocol name, as logged.
    pub fn name(self) -> &'static str {
        match self {
            Command::Query => "QUERY",
            Command::Challenge => "CHALLENGE",
            Command::Echo => "ECHO",
            Command::Heartbeat => "HEARTBEAT",
            Command::AddError => "ADDERROR",
            Command::EchoResponse => "ECHO_RESPONSE",
            Command::ClientMessage => "CLIENT_MESSAGE",
            Command::ClientMessageAck => "CLIENT_MESSAGE_ACK",
            Command::KeepAlive => "KEEPALIVE",
            Command::Available => "AVAILABLE",
            Command::ClientRegistered => "CLIENT_REGISTERED",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x00 => Command::Query,
            0x01 => Command::Challenge,
            0x02 => Command::Echo,
            0x03 => Command::Heartbeat,
            0x04 => Command::AddError,
            0x05 => Command::EchoResponse,
            0x06 => Command::ClientMessage,
            0x07 => Command::ClientMessageAck,
            0x08 => Command::KeepAlive,
            0x09 => Command::Available,
            0x0A => Command::ClientRegistered,
            other => return Err(other),
        })
    }
}

/// A decoded request datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'a> {
    /// Availability probe. Needs no session id.
    Available,
    /// Any session-addressed command.
    Session {
        /// Command code.
        command: Command,
        /// Client-chosen session id.
        session_id: u32,
        /// Bytes after the header.
        payload: &'a [u8],
    },
}

/// Datagram framing errors. The datagram is dropped; the server keeps running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatagramError {
    /// Zero-length datagram.
    #[error("empty datagram")]
    Empty,
    /// Too short to carry a session id.
    #[error("datagram of {0} bytes has no session id")]
    Truncated(usize),
    /// Unrecognized command byte.
    #[error("unknown command 0x{command:02x} for session {session_id}")]
    UnknownCommand {
        /// Raw command byte.
        command: u8,
        /// Session id from the header.
        session_id: u32,
    },
}

/// Decode the fixed header of a datagram.
pub fn parse_datagram(buf: &[u8]) -> Result<Request<'_>, DatagramError> {
    let first = *buf.first().ok_or(DatagramError::Empty)?;
    if first == Command::Available as u8 {
        return Ok(Request::Available);
    }

    if buf.len() < PAYLOAD_OFFSET {
        return Err(DatagramError::Truncated(buf.len()));
    }
    let session_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);

    let command = Command::try_from(first)
        .map_err(|command| DatagramError::UnknownCommand { command, session_id })?;

    Ok(Request::Session {
        command,
        session_id,
        payload: &buf[PAYLOAD_OFFSET..],
    })
}

/// `FE FD <cmd> <session id BE>`.
pub fn response_header(command: Command, session_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    out.extend_from_slice(&RESPONSE_MAGIC);
    out.push(command as u8);
    out.extend_from_slice(&session_id.to_be_bytes());
    out
}

/// Challenge reply: header + challenge + `00` + hex IP + hex port + NUL.
pub fn challenge_frame(
    session_id: u32,
    challenge: &str,
    observed: &SocketAddr,
) -> Result<Vec<u8>, AddressError> {
    let suffix = addr::hex_ip_port(observed)?;
    let mut out = response_header(Command::Challenge, session_id);
    out.extend_from_slice(challenge.as_bytes());
    out.extend_from_slice(suffix.as_bytes());
    out.push(0);
    Ok(out)
}

// =============================================================================
// HEARTBEAT PAYLOAD
// =============================================================================

/// Value of the reserved `statechanged` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// `"1"`: mid-session update.
    Update,
    /// `"2"`: client is shutting the session down.
    Shutdown,
    /// Any other value, kept verbatim.
    Other(String),
}

impl StateChange {
    fn parse(value: &str) -> Self {
        match value {
            "1" => StateChange::Update,
            "2" => StateChange::Shutdown,
            other => StateChange::Other(other.to_string()),
        }
    }

    /// Wire value.
    pub fn as_str(&self) -> &str {
        match self {
            StateChange::Update => "1",
            StateChange::Shutdown => "2",
            StateChange::Other(v) => v,
        }
    }
}

/// Typed heartbeat report.
///
/// The engine inspects only `statechanged`, `publicip` and `publicport`;
/// everything else is game-specific and carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// `statechanged`.
    pub state_changed: Option<StateChange>,
    /// `publicip` as reported (or reconciled).
    pub public_ip: Option<String>,
    /// `publicport` as reported (or reconciled).
    pub public_port: Option<String>,
    /// Remaining keys.
    pub fields: BTreeMap<String, String>,
}

impl Heartbeat {
    /// Parse NUL-delimited `key\0value\0...` pairs.
    ///
    /// Stops at the first empty key or at a key with no value.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let mut parts = text.split('\0');
        let mut heartbeat = Heartbeat::default();

        while let Some(key) = parts.next() {
            if key.is_empty() {
                break;
            }
            let Some(value) = parts.next() else {
                break;
            };
            heartbeat.set(key, value);
        }

        heartbeat
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "statechanged" => self.state_changed = Some(StateChange::parse(value)),
            "publicip" => self.public_ip = Some(value.to_string()),
            "publicport" => self.public_port = Some(value.to_string()),
            _ => {
                self.fields.insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Look up any key, reserved or not.
    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "statechanged" => self.state_changed.as_ref().map(StateChange::as_str),
            "publicip" => self.public_ip.as_deref(),
            "publicport" => self.public_port.as_deref(),
            _ => self.fields.get(key).map(String::as_str),
        }
    }

    /// Whether the client asked to end the session.
    pub fn is_shutdown(&self) -> bool {
        self.state_changed == Some(StateChange::Shutdown)
    }

    /// Compare `publicip` against the observed source address and overwrite
    /// `publicip`/`publicport` when it is missing or wrong.
    ///
    /// Returns `true` when the reported address already matched.
    pub fn reconcile_public_addr(&mut self, observed: &SocketAddr) -> bool {
        let (real_ip, real_port) = addr::observed_ip_port(observed);
        if self.public_ip.as_deref() == Some(real_ip.as_str()) {
            return true;
        }
        self.public_ip = Some(real_ip);
        self.public_port = Some(real_port);
        false
    }
}
