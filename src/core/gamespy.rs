//! GameSpy Text Protocol Codec
//!
//! Presence traffic is a flat sequence of backslash-delimited key/value pairs
//! terminated by `\final\`:
//!
//! ```text
//! \bm\1\sesskey\12345\t\200\msg\GPCM3vMAT...\final\
//! ```
//!
//! The first pair is the command and its value; everything after it is an
//! ordered list of fields. Values cannot contain a backslash.

use thiserror::Error;

/// Frame terminator.
pub const FRAME_TERMINATOR: &str = "\\final\\";

/// A single decoded command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GameSpyCommand {
    /// Command name (`login`, `bm`, `addbuddy`, ...).
    pub command: String,
    /// Value attached to the command key (often empty).
    pub value: String,
    /// Remaining fields in wire order.
    pub fields: Vec<(String, String)>,
}

impl GameSpyCommand {
    /// Create a command with no fields.
    pub fn new(command: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            value: value.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire text, including the terminator.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(32 + self.fields.len() * 16);
        out.push('\\');
        out.push_str(&self.command);
        out.push('\\');
        out.push_str(&self.value);
        for (key, value) in &self.fields {
            out.push('\\');
            out.push_str(key);
            out.push('\\');
            out.push_str(value);
        }
        out.push_str(FRAME_TERMINATOR);
        out
    }

    /// Parse one frame. The trailing `\final\` is optional.
    pub fn parse(frame: &str) -> Result<Self, CodecError> {
        let body = frame.strip_suffix(FRAME_TERMINATOR).unwrap_or(frame);
        let body = body.strip_prefix('\\').ok_or(CodecError::MissingLeadingSlash)?;

        let mut parts = body.split('\\');
        let command = match parts.next() {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => return Err(CodecError::MissingCommand),
        };
        let value = parts.next().unwrap_or_default().to_string();

        let mut fields = Vec::new();
        while let Some(key) = parts.next() {
            let value = parts
                .next()
                .ok_or_else(|| CodecError::DanglingKey(key.to_string()))?;
            fields.push((key.to_string(), value.to_string()));
        }

        Ok(Self { command, value, fields })
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Frame does not start with `\`.
    #[error("frame does not start with a backslash")]
    MissingLeadingSlash,
    /// Empty command name.
    #[error("missing command name")]
    MissingCommand,
    /// A key without a value.
    #[error("key {0:?} has no value")]
    DanglingKey(String),
    /// Invalid base64 payload.
    #[error("invalid base64: {0}")]
    Base64(String),
}

/// Pop the next complete frame off an inbound byte buffer.
///
/// Returns `None` until a terminator has been received.
pub fn take_frame(buffer: &mut Vec<u8>) -> Option<String> {
    let terminator = FRAME_TERMINATOR.as_bytes();
    let end = buffer
        .windows(terminator.len())
        .position(|w| w == terminator)?
        + terminator.len();

    let frame: Vec<u8> = buffer.drain(..end).collect();
    Some(String::from_utf8_lossy(&frame).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_bm_frame() {
        let cmd = GameSpyCommand::new("bm", "1")
            .with("f", "100")
            .with("msg", "hello");
        assert_eq!(cmd.encode(), "\\bm\\1\\f\\100\\msg\\hello\\final\\");
    }

    #[test]
    fn test_parse_with_empty_value() {
        let cmd = GameSpyCommand::parse("\\logout\\\\sesskey\\5\\final\\").unwrap();
        assert_eq!(cmd.command, "logout");
        assert_eq!(cmd.value, "");
        assert_eq!(cmd.get("sesskey"), Some("5"));
    }

    #[test]
    fn test_parse_keepalive() {
        let cmd = GameSpyCommand::parse("\\ka\\\\final\\").unwrap();
        assert_eq!(cmd.command, "ka");
        assert!(cmd.fields.is_empty());
    }

    #[test]
    fn test_parse_rejects_dangling_key() {
        let result = GameSpyCommand::parse("\\status\\1\\statstring\\final\\");
        assert!(matches!(result, Err(CodecError::DanglingKey(k)) if k == "statstring"));
    }

    #[test]
    fn test_parse_rejects_missing_slash() {
        assert_eq!(
            GameSpyCommand::parse("bm\\1\\final\\"),
            Err(CodecError::MissingLeadingSlash)
        );
    }

    #[test]
    fn test_take_frame_splits_coalesced_reads() {
        let mut buffer = b"\\ka\\\\final\\\\status\\1\\final\\\\bm\\1".to_vec();

        assert_eq!(take_frame(&mut buffer).as_deref(), Some("\\ka\\\\final\\"));
        assert_eq!(take_frame(&mut buffer).as_deref(), Some("\\status\\1\\final\\"));
        assert_eq!(take_frame(&mut buffer), None);
        assert_eq!(buffer, b"\\bm\\1".to_vec());
    }

    proptest! {
        #[test]
        fn parse_never_panics(input in "\\PC*") {
            let _ = GameSpyCommand::parse(&input);
        }

        #[test]
        fn encoded_fields_survive_parse(
            key in "[a-z]{1,8}",
            value in "[a-zA-Z0-9|.]{0,16}",
        ) {
            let cmd = GameSpyCommand::new("status", "1").with(key.clone(), value.clone());
            let parsed = GameSpyCommand::parse(&cmd.encode()).unwrap();
            prop_assert_eq!(parsed.get(&key), Some(value.as_str()));
        }
    }
}
