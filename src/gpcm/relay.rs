//! Message Relay
//!
//! Delivers `bm` frames to a connected client. Delivery is best effort: there
//! is no acknowledgement, and a failed write is logged and otherwise ignored.

use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::core::gamespy::GameSpyCommand;

/// Transport write errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Connection already closed.
    #[error("connection closed")]
    Closed,
    /// Outbound queue full.
    #[error("outbound queue full")]
    Backlogged,
}

/// Write side of a client connection.
///
/// `write` must not block: it is called while the presence registry lock is
/// held.
pub trait Transport: Send + Sync {
    /// Queue bytes for the client.
    fn write(&self, bytes: &[u8]) -> Result<(), RelayError>;

    /// Peer address of the connection.
    fn remote_addr(&self) -> SocketAddr;
}

/// Transport backed by a bounded channel drained by a socket writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<Vec<u8>>,
    remote: SocketAddr,
}

impl ChannelTransport {
    /// Wrap a channel sender.
    pub fn new(sender: mpsc::Sender<Vec<u8>>, remote: SocketAddr) -> Self {
        Self { sender, remote }
    }
}

impl Transport for ChannelTransport {
    fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        self.sender.try_send(bytes.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::Backlogged,
            TrySendError::Closed(_) => RelayError::Closed,
        })
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// `bm` sub-types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `1`: direct message between friends.
    Direct,
    /// `2`: friendship became mutual.
    MutualNotice,
    /// `4`: friend authorization acknowledged.
    AuthAck,
    /// `100`: presence status.
    Status,
}

impl MessageKind {
    /// Wire value.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Direct => "1",
            MessageKind::MutualNotice => "2",
            MessageKind::AuthAck => "4",
            MessageKind::Status => "100",
        }
    }
}

/// `\bm\<kind>\f\<from>\msg\<msg>\final\`.
pub fn relay_frame(kind: MessageKind, from: u32, msg: &str) -> GameSpyCommand {
    GameSpyCommand::new("bm", kind.as_str())
        .with("f", from.to_string())
        .with("msg", msg)
}

/// Serialize and write a relay frame. Returns whether the write was accepted.
pub fn send_message(transport: &dyn Transport, kind: MessageKind, from: u32, msg: &str) -> bool {
    let frame = relay_frame(kind, from, msg).encode();
    match transport.write(frame.as_bytes()) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "GPCM: Relay {} from {} to {} dropped: {}",
                kind.as_str(),
                from,
                transport.remote_addr(),
                e
            );
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;

    #[test]
    fn test_relay_frame_fields() {
        let frame = relay_frame(MessageKind::Status, 100, "|s|1|ss|");
        assert_eq!(frame.encode(), "\\bm\\100\\f\\100\\msg\\|s|1|ss|\\final\\");
    }

    #[test]
    fn test_send_message_writes_frame() {
        let transport = RecordingTransport::new("1.2.3.4:1000");
        assert!(send_message(&transport, MessageKind::AuthAck, 7, ""));

        let frames = transport.relayed(MessageKind::AuthAck);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("f"), Some("7"));
        assert_eq!(frames[0].get("msg"), Some(""));
    }

    #[test]
    fn test_send_message_failure_is_not_fatal() {
        let transport = RecordingTransport::closed("1.2.3.4:1000");
        assert!(!send_message(&transport, MessageKind::Direct, 7, "hi"));
    }

    #[tokio::test]
    async fn test_channel_transport_backpressure() {
        let (tx, mut rx) = mpsc::channel(1);
        let transport = ChannelTransport::new(tx, "1.2.3.4:1000".parse().unwrap());

        assert_eq!(transport.write(b"a"), Ok(()));
        assert_eq!(transport.write(b"b"), Err(RelayError::Backlogged));
        assert_eq!(rx.recv().await, Some(b"a".to_vec()));

        drop(rx);
        assert_eq!(transport.write(b"c"), Err(RelayError::Closed));
    }
}
