//! Route Protocol Frames
//!
//! Defines the binary protocol spoken between servers on the cluster port.
//! Frames are serialized with bincode and carried behind a 4-byte big-endian
//! length prefix.

use bincode::{Decode, Encode};
use bytes::{Buf, BufMut, BytesMut};

use super::ProtocolError;

/// Protocol version for compatibility checking
pub const ROUTE_PROTOCOL_VERSION: u8 = 1;

/// Length prefix size
pub const FRAME_HEADER_LEN: usize = 4;

/// Handshake payload sent by both sides as the first frame
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct HandshakeInfo {
    /// Server identity of the sender
    pub server_id: String,
    /// Human-readable server name
    pub name: String,
    /// Protocol version
    pub version: u8,
    /// Cluster name, if the sender has one configured
    pub cluster: Option<String>,
    /// Address the sender accepts routes on
    pub listen: String,
}

/// A destination server for a forwarded message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MsgTarget {
    /// Server that must deliver the message
    pub server: String,
    /// Queue groups that server must pick a member from
    pub queues: Vec<String>,
}

/// A message forwarded between servers
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RouteMsg {
    /// Server the message was originally published on
    pub origin: String,
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
    /// Servers still to be reached, with their queue assignments
    pub targets: Vec<MsgTarget>,
    /// Route hops travelled so far
    pub hops: u8,
}

/// Frames exchanged between servers over a route
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RouteFrame {
    /// Identity/version handshake
    Info(HandshakeInfo),

    /// Sent by the arbitrating side: the route is established
    Accept,

    /// Sent by the arbitrating side: the connection is refused
    Reject { reason: String },

    /// Interest added on `origin`
    Sub {
        origin: String,
        subject: String,
        queue: Option<String>,
    },

    /// Interest removed on `origin`
    Unsub {
        origin: String,
        subject: String,
        queue: Option<String>,
    },

    /// Forwarded message
    Msg(RouteMsg),

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,
}

impl RouteFrame {
    /// Encode frame body using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode frame body using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(frame, _)| frame)
    }

    /// Get the frame type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            RouteFrame::Info(_) => "Info",
            RouteFrame::Accept => "Accept",
            RouteFrame::Reject { .. } => "Reject",
            RouteFrame::Sub { .. } => "Sub",
            RouteFrame::Unsub { .. } => "Unsub",
            RouteFrame::Msg(_) => "Msg",
            RouteFrame::Ping => "Ping",
            RouteFrame::Pong => "Pong",
        }
    }
}

/// Append a length-prefixed frame to `buf`
pub fn write_frame(frame: &RouteFrame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = frame.encode()?;
    put_body(&body, buf);
    Ok(())
}

/// Like [`write_frame`], but refuses a frame whose body exceeds `max_frame`.
///
/// `buf` is left untouched when the frame is refused.
pub fn write_frame_within(
    frame: &RouteFrame,
    buf: &mut BytesMut,
    max_frame: usize,
) -> Result<(), ProtocolError> {
    let body = frame.encode()?;
    if body.len() > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_frame,
        });
    }
    put_body(&body, buf);
    Ok(())
}

fn put_body(body: &[u8], buf: &mut BytesMut) {
    buf.reserve(FRAME_HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Incremental decoder over a read buffer
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<RouteFrame>, ProtocolError> {
        let len = match read_frame_length(buf) {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        if len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        if buf.len() < FRAME_HEADER_LEN + len {
            buf.reserve(FRAME_HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let body = buf.split_to(len);
        Ok(Some(RouteFrame::decode(&body)?))
    }
}
