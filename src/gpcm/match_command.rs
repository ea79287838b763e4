//! Match Commands
//!
//! Peer-to-peer matchmaking messages are tunnelled through friend messages as
//!
//! ```text
//! GPCM <version digits> vMAT <opcode byte> <DWC base64 payload>
//! ```
//!
//! The relay validates the envelope and decodes the payload before forwarding
//! the original text unchanged.

use std::net::Ipv4Addr;

use crate::core::encoding;
use crate::gpcm::error::MessageError;

/// Decoded match command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCommand {
    /// Ask the host for a slot.
    ReservationRequest {
        /// Requester public address.
        public_ip: Ipv4Addr,
        /// Requester public port.
        public_port: u16,
        /// Requester LAN address.
        local_ip: Ipv4Addr,
        /// Requester LAN port.
        local_port: u16,
    },
    /// Host refused the reservation.
    ReservationDeny {
        /// Refusal reason.
        reason: u32,
    },
    /// Host is busy; retry later.
    ReservationWait,
    /// Host accepted the reservation.
    ReservationOk {
        /// Host profile id.
        profile_id: u32,
        /// Assigned AID.
        aid: u32,
        /// Room capacity.
        max_players: u32,
    },
    /// Peer address announcement.
    TellAddress {
        /// Address.
        ip: Ipv4Addr,
        /// Port.
        port: u16,
    },
    /// Profile id / AID assignment.
    NewPidAid {
        /// Profile id.
        profile_id: u32,
        /// AID.
        aid: u32,
    },
    /// Reservation withdrawn.
    ReservationCancel,
}

impl MatchCommand {
    /// Wire opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            MatchCommand::ReservationRequest { .. } => 0x01,
            MatchCommand::ReservationDeny { .. } => 0x02,
            MatchCommand::ReservationWait => 0x03,
            MatchCommand::ReservationOk { .. } => 0x04,
            MatchCommand::TellAddress { .. } => 0x05,
            MatchCommand::NewPidAid { .. } => 0x06,
            MatchCommand::ReservationCancel => 0x07,
        }
    }
}

/// Decodes match-command payloads.
pub trait MatchCommandCodec: Send + Sync {
    /// Decode `payload` for `opcode`; `None` when it is not a valid command.
    fn decode(&self, opcode: u8, payload: &[u8]) -> Option<MatchCommand>;
}

/// Codec for the DWC reservation command family (big-endian fields).
#[derive(Debug, Default, Clone, Copy)]
pub struct DwcMatchCodec;

fn be_u32(payload: &[u8], at: usize) -> Option<u32> {
    let bytes = payload.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn be_u16(payload: &[u8], at: usize) -> Option<u16> {
    let bytes = payload.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

impl MatchCommandCodec for DwcMatchCodec {
    fn decode(&self, opcode: u8, payload: &[u8]) -> Option<MatchCommand> {
        Some(match opcode {
            0x01 => MatchCommand::ReservationRequest {
                public_ip: Ipv4Addr::from(be_u32(payload, 0)?),
                public_port: be_u16(payload, 4)?,
                local_ip: Ipv4Addr::from(be_u32(payload, 6)?),
                local_port: be_u16(payload, 10)?,
            },
            0x02 => MatchCommand::ReservationDeny {
                reason: be_u32(payload, 0)?,
            },
            0x03 => MatchCommand::ReservationWait,
            0x04 => MatchCommand::ReservationOk {
                profile_id: be_u32(payload, 0)?,
                aid: be_u32(payload, 4)?,
                max_players: be_u32(payload, 8)?,
            },
            0x05 => MatchCommand::TellAddress {
                ip: Ipv4Addr::from(be_u32(payload, 0)?),
                port: be_u16(payload, 4)?,
            },
            0x06 => MatchCommand::NewPidAid {
                profile_id: be_u32(payload, 0)?,
                aid: be_u32(payload, 4)?,
            },
            0x07 => MatchCommand::ReservationCancel,
            _ => return None,
        })
    }
}

/// Validate the `GPCM..vMAT` envelope and decode the embedded command.
pub fn parse_match_message(
    msg: &str,
    codec: &dyn MatchCommandCodec,
) -> Result<MatchCommand, MessageError> {
    let bytes = msg.as_bytes();
    if !msg.starts_with("GPCM") {
        return Err(MessageError::Prefix);
    }

    let marker = msg.find("vMAT").ok_or(MessageError::Header)?;
    let opcode_at = marker + 4;

    let is_digit = |i: usize, lo: u8| bytes.get(i).is_some_and(|b| (lo..=b'9').contains(b));
    let header_ok = match opcode_at {
        // One version digit: GPCM9vMAT
        9 => is_digit(4, b'1') && bytes.len() >= 11,
        // Two version digits: GPCM10vMAT
        10 => is_digit(4, b'1') && is_digit(5, b'0') && bytes.len() >= 12,
        _ => false,
    };
    if !header_ok {
        return Err(MessageError::Header);
    }

    let opcode = bytes[opcode_at];
    let body = msg.get(opcode_at + 1..).ok_or(MessageError::Header)?;
    let payload = encoding::decode(body).map_err(|_| MessageError::Base64)?;

    codec
        .decode(opcode, &payload)
        .ok_or(MessageError::Command(opcode))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(version: &str, opcode: u8, payload: &[u8]) -> String {
        format!("GPCM{}vMAT{}{}", version, opcode as char, encoding::encode(payload))
    }

    #[test]
    fn test_decode_reservation_request() {
        let payload = [1, 2, 3, 4, 0x19, 0x64, 192, 168, 0, 2, 0x19, 0x65];
        let cmd = parse_match_message(&message("3", 0x01, &payload), &DwcMatchCodec).unwrap();
        assert_eq!(
            cmd,
            MatchCommand::ReservationRequest {
                public_ip: Ipv4Addr::new(1, 2, 3, 4),
                public_port: 6500,
                local_ip: Ipv4Addr::new(192, 168, 0, 2),
                local_port: 6501,
            }
        );
        assert_eq!(cmd.opcode(), 0x01);
    }

    #[test]
    fn test_two_digit_version() {
        let cmd = parse_match_message(&message("10", 0x02, &[0, 0, 0, 5]), &DwcMatchCodec).unwrap();
        assert_eq!(cmd, MatchCommand::ReservationDeny { reason: 5 });
    }

    #[test]
    fn test_bad_prefix() {
        assert_eq!(
            parse_match_message("XXXX3vMAT\x03AAAA", &DwcMatchCodec),
            Err(MessageError::Prefix)
        );
    }

    #[test]
    fn test_missing_marker() {
        assert_eq!(parse_match_message("GPCM3xxxx\x03AAAA", &DwcMatchCodec), Err(MessageError::Header));
    }

    #[test]
    fn test_bad_version_digits() {
        assert_eq!(parse_match_message("GPCM0vMAT\x03AAAA", &DwcMatchCodec), Err(MessageError::Header));
        assert_eq!(parse_match_message("GPCMa1vMAT\x03AAAA", &DwcMatchCodec), Err(MessageError::Header));
        assert_eq!(parse_match_message("GPCM123vMAT\x03AAAA", &DwcMatchCodec), Err(MessageError::Header));
    }

    #[test]
    fn test_length_class_minimums() {
        // Opcode present but no payload characters.
        assert_eq!(parse_match_message("GPCM3vMAT\x03", &DwcMatchCodec), Err(MessageError::Header));
        assert_eq!(parse_match_message("GPCM10vMAT\x03", &DwcMatchCodec), Err(MessageError::Header));
    }

    #[test]
    fn test_bad_base64() {
        assert_eq!(parse_match_message("GPCM3vMAT\x03!!!!", &DwcMatchCodec), Err(MessageError::Base64));
    }

    #[test]
    fn test_short_payload_rejected_by_codec() {
        assert_eq!(
            parse_match_message(&message("3", 0x04, &[0, 0, 0, 1]), &DwcMatchCodec),
            Err(MessageError::Command(0x04))
        );
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            parse_match_message(&message("3", 0x7F, &[0, 0, 0, 1]), &DwcMatchCodec),
            Err(MessageError::Command(0x7F))
        );
    }
}
