//! Payload codec for the per-robot channels
//!
//! Payloads are short ASCII words carried as raw bytes:
//! ```text
//! control  -> "FORWARD"          status -> "admin_connected"          ai_mode -> "ON"
//! ```
//! Decoding is case-insensitive and ignores surrounding whitespace.

use bytes::Bytes;
use thiserror::Error;

use crate::topics::Channel;
use crate::{Command, ControlMode, RobotStatus};

/// Largest payload accepted on any channel
pub const MAX_PAYLOAD_SIZE: usize = 64;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Unknown {channel} value: {value:?}")]
    UnknownValue { channel: Channel, value: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
}

/// Encode a motion command for the `control` channel
pub fn encode_command(command: Command) -> Bytes {
    Bytes::from_static(command.as_str().as_bytes())
}

/// Encode a presence status for the `status` channel
pub fn encode_status(status: RobotStatus) -> Bytes {
    Bytes::from_static(status.as_str().as_bytes())
}

/// Encode a control mode for the `ai_mode` channel
pub fn encode_mode(mode: ControlMode) -> Bytes {
    Bytes::from_static(mode.as_payload().as_bytes())
}

pub fn decode_command(payload: &[u8]) -> Result<Command, CodecError> {
    payload_text(payload)?.parse()
}

pub fn decode_status(payload: &[u8]) -> Result<RobotStatus, CodecError> {
    payload_text(payload)?.parse()
}

/// Validate size and encoding, returning the trimmed text
fn payload_text(payload: &[u8]) -> Result<&str, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let text = std::str::from_utf8(payload)
        .map_err(|_| CodecError::InvalidUtf8)?
        .trim();

    if text.is_empty() {
        return Err(CodecError::EmptyPayload);
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_values() {
        assert_eq!(&encode_command(Command::Forward)[..], b"FORWARD");
        assert_eq!(&encode_command(Command::Stop)[..], b"STOP");
        assert_eq!(decode_command(b"left").unwrap(), Command::Left);
    }

    #[test]
    fn test_status_decoding_is_lenient_on_case_and_whitespace() {
        assert_eq!(decode_status(b"Online\r\n").unwrap(), RobotStatus::Online);
        assert_eq!(
            decode_status(b"ADMIN_DISCONNECTED").unwrap(),
            RobotStatus::AdminDisconnected
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode_status(b"   "), Err(CodecError::EmptyPayload));
        assert_eq!(decode_status(&[0xc3, 0x28]), Err(CodecError::InvalidUtf8));

        let big = vec![b'a'; MAX_PAYLOAD_SIZE + 1];
        assert_eq!(
            decode_command(&big),
            Err(CodecError::PayloadTooLarge(MAX_PAYLOAD_SIZE + 1))
        );

        match decode_status(b"sleeping") {
            Err(CodecError::UnknownValue { channel, value }) => {
                assert_eq!(channel, Channel::Status);
                assert_eq!(value, "sleeping");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_mode_encoding() {
        assert_eq!(&encode_mode(ControlMode::Autonomous)[..], b"ON");
        assert_eq!(&encode_mode(ControlMode::Manual)[..], b"OFF");
    }
}
