//! Protocol error types

use std::fmt;

/// Errors raised while decoding or encoding either wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Operation name not recognized
    UnknownOperation(String),
    /// Operation recognized but its arguments are malformed
    InvalidArguments(&'static str),
    /// Payload size field is not a number or exceeds the limit
    InvalidPayloadSize,
    /// Payload exceeds the configured maximum
    PayloadTooLarge { size: usize, max: usize },
    /// Payload was not followed by CRLF
    MissingPayloadTerminator,
    /// Control line is not valid UTF-8
    InvalidUtf8,
    /// Control line exceeds the maximum length without a terminator
    ControlLineTooLong,
    /// Route frame exceeds the maximum frame size
    FrameTooLarge { size: usize, max: usize },
    /// Route frame could not be encoded
    Encode(String),
    /// Route frame could not be decoded
    Decode(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperation(op) => write!(f, "unknown protocol operation: {}", op),
            Self::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
            Self::InvalidPayloadSize => write!(f, "invalid payload size"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload of {} bytes exceeds maximum of {}", size, max)
            }
            Self::MissingPayloadTerminator => write!(f, "payload not terminated by CRLF"),
            Self::InvalidUtf8 => write!(f, "control line is not valid UTF-8"),
            Self::ControlLineTooLong => write!(f, "control line too long"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds maximum of {}", size, max)
            }
            Self::Encode(msg) => write!(f, "encode error: {}", msg),
            Self::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<bincode::error::EncodeError> for ProtocolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ProtocolError::Encode(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ProtocolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}
