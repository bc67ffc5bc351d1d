//! Wire protocol message types.
//!
//! A [`Frame`] is a fixed 18-byte header followed by an opaque payload.
//! Control messages repurpose header fields and payload:
//!
//! - `REGISTER_REQUEST`: `destination` is the requested id (or
//!   [`AgentId::DYNAMIC_SENTINEL`]), payload is the cookie (empty = none).
//! - `REGISTER_REPLY`: payload is the assigned id (4 bytes) followed by the
//!   router's heartbeat period in milliseconds (4 bytes, 0 = no heartbeats).
//! - `ERROR`: payload is an [`ErrorCode`] (4 bytes) plus optional UTF-8 detail.
//! - `LIST_REPLY`: payload is a sequence of [`AgentDescriptor`]s.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pamr_types::{AgentId, MagicCookie, PamrError};
use std::fmt;
use std::time::Duration;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 18;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Address used by the router for frames it originates on its own behalf.
pub const ROUTER_ADDRESS: u32 = 0;

/// The kinds of frames. Discriminants are the on-wire type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RegisterRequest = 0,
    RegisterReply = 1,
    Data = 2,
    DataReply = 3,
    Error = 4,
    ListRequest = 5,
    ListReply = 6,
    HeartbeatRouter = 7,
    HeartbeatAgent = 8,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::RegisterRequest,
            1 => Self::RegisterReply,
            2 => Self::Data,
            3 => Self::DataReply,
            4 => Self::Error,
            5 => Self::ListRequest,
            6 => Self::ListReply,
            7 => Self::HeartbeatRouter,
            8 => Self::HeartbeatAgent,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RegisterRequest => "REG_REQ",
            Self::RegisterReply => "REG_REP",
            Self::Data => "DATA",
            Self::DataReply => "DATA_REP",
            Self::Error => "ERR",
            Self::ListRequest => "LIST_REQ",
            Self::ListReply => "LIST_REP",
            Self::HeartbeatRouter => "HB_ROUTER",
            Self::HeartbeatAgent => "HB_AGENT",
        };
        f.write_str(name)
    }
}

/// Error codes carried in `ERROR` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    DestinationUnknown = 1,
    AuthFailure = 2,
    IdInUse = 3,
    ProtocolViolation = 4,
    InvalidAgentId = 5,
    PeerDisconnected = 6,
    RemoteFailure = 7,
    CapacityExhausted = 8,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::DestinationUnknown,
            2 => Self::AuthFailure,
            3 => Self::IdInUse,
            4 => Self::ProtocolViolation,
            5 => Self::InvalidAgentId,
            6 => Self::PeerDisconnected,
            7 => Self::RemoteFailure,
            8 => Self::CapacityExhausted,
            _ => return None,
        })
    }

    /// The code a router or agent reports for `err`.
    pub fn for_error(err: &PamrError) -> Self {
        match err {
            PamrError::DestinationUnknown(_) | PamrError::NotYetAvailable { .. } => {
                Self::DestinationUnknown
            }
            PamrError::AuthFailure(_) => Self::AuthFailure,
            PamrError::IdInUse(_) => Self::IdInUse,
            PamrError::InvalidAgentId(_) => Self::InvalidAgentId,
            PamrError::PeerDisconnected(_) => Self::PeerDisconnected,
            PamrError::CapacityExhausted => Self::CapacityExhausted,
            PamrError::ProtocolViolation(_) => Self::ProtocolViolation,
            _ => Self::RemoteFailure,
        }
    }

    /// Rebuild the typed error for an `ERROR` frame about agent `subject`.
    pub fn into_error(self, subject: u32, detail: String) -> PamrError {
        let agent = match AgentId::new(subject) {
            Ok(agent) => agent,
            Err(_) if self == Self::InvalidAgentId => return PamrError::InvalidAgentId(subject),
            Err(_) if self == Self::CapacityExhausted => return PamrError::CapacityExhausted,
            Err(_) => return PamrError::ProtocolViolation(format!("{self:?}: {detail}")),
        };
        match self {
            Self::DestinationUnknown => PamrError::DestinationUnknown(agent),
            Self::AuthFailure => PamrError::AuthFailure(agent),
            Self::IdInUse => PamrError::IdInUse(agent),
            Self::ProtocolViolation => PamrError::ProtocolViolation(detail),
            Self::InvalidAgentId => PamrError::InvalidAgentId(subject),
            Self::PeerDisconnected => PamrError::PeerDisconnected(agent),
            Self::RemoteFailure => PamrError::RemoteFailure(detail),
            Self::CapacityExhausted => PamrError::CapacityExhausted,
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub message_id: u32,
    pub source: u32,
    pub destination: u32,
    pub one_way: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn register_request(
        message_id: u32,
        requested: Option<AgentId>,
        cookie: Option<&MagicCookie>,
    ) -> Self {
        Self {
            kind: MessageType::RegisterRequest,
            message_id,
            source: AgentId::DYNAMIC_SENTINEL,
            destination: requested.map_or(AgentId::DYNAMIC_SENTINEL, AgentId::get),
            one_way: false,
            payload: cookie.map_or_else(Bytes::new, |c| Bytes::copy_from_slice(c.as_bytes())),
        }
    }

    pub fn register_reply(
        message_id: u32,
        assigned: AgentId,
        heartbeat_period: Option<Duration>,
    ) -> Self {
        let period_ms = heartbeat_period.map_or(0, |p| p.as_millis().min(u32::MAX as u128) as u32);
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(assigned.get());
        payload.put_u32(period_ms);
        Self {
            kind: MessageType::RegisterReply,
            message_id,
            source: ROUTER_ADDRESS,
            destination: assigned.get(),
            one_way: false,
            payload: payload.freeze(),
        }
    }

    pub fn data(
        message_id: u32,
        source: AgentId,
        destination: AgentId,
        payload: Bytes,
        one_way: bool,
    ) -> Self {
        Self {
            kind: MessageType::Data,
            message_id,
            source: source.get(),
            destination: destination.get(),
            one_way,
            payload,
        }
    }

    /// Reply to `request`, travelling back to its source.
    pub fn data_reply(request: &Frame, payload: Bytes) -> Self {
        Self {
            kind: MessageType::DataReply,
            message_id: request.message_id,
            source: request.destination,
            destination: request.source,
            one_way: true,
            payload,
        }
    }

    /// Error frame. `faulty` is the agent the error is about, `recipient`
    /// the agent being told.
    pub fn error(
        message_id: u32,
        faulty: u32,
        recipient: u32,
        code: ErrorCode,
        detail: &str,
    ) -> Self {
        let mut payload = BytesMut::with_capacity(4 + detail.len());
        payload.put_u32(code as u32);
        payload.put_slice(detail.as_bytes());
        Self {
            kind: MessageType::Error,
            message_id,
            source: faulty,
            destination: recipient,
            one_way: true,
            payload: payload.freeze(),
        }
    }

    pub fn list_request(message_id: u32, source: AgentId) -> Self {
        Self {
            kind: MessageType::ListRequest,
            message_id,
            source: source.get(),
            destination: ROUTER_ADDRESS,
            one_way: false,
            payload: Bytes::new(),
        }
    }

    pub fn list_reply(message_id: u32, recipient: AgentId, agents: &[AgentDescriptor]) -> Self {
        Self {
            kind: MessageType::ListReply,
            message_id,
            source: ROUTER_ADDRESS,
            destination: recipient.get(),
            one_way: true,
            payload: encode_agent_list(agents),
        }
    }

    pub fn heartbeat_router(heartbeat_id: u32, recipient: AgentId) -> Self {
        Self::heartbeat(MessageType::HeartbeatRouter, heartbeat_id, ROUTER_ADDRESS, recipient.get())
    }

    pub fn heartbeat_agent(heartbeat_id: u32, source: AgentId) -> Self {
        Self::heartbeat(MessageType::HeartbeatAgent, heartbeat_id, source.get(), ROUTER_ADDRESS)
    }

    fn heartbeat(kind: MessageType, id: u32, source: u32, destination: u32) -> Self {
        Self {
            kind,
            message_id: id,
            source,
            destination,
            one_way: true,
            payload: Bytes::new(),
        }
    }

    /// Requested id of a `REGISTER_REQUEST`, `None` for dynamic.
    pub fn requested_id(&self) -> Option<u32> {
        (self.destination != AgentId::DYNAMIC_SENTINEL).then_some(self.destination)
    }

    /// Cookie of a `REGISTER_REQUEST`, `None` when the payload is empty.
    pub fn cookie(&self) -> Result<Option<MagicCookie>, WireError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        let text = std::str::from_utf8(&self.payload)
            .map_err(|_| WireError::Malformed("magic cookie is not valid UTF-8".into()))?;
        MagicCookie::new(text)
            .map(Some)
            .map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Assigned id carried by a `REGISTER_REPLY`.
    pub fn assigned_id(&self) -> Result<AgentId, WireError> {
        let raw = read_u32_payload(self.payload.get(..4).unwrap_or(&self.payload[..]))?;
        AgentId::new(raw).map_err(|e| WireError::Malformed(e.to_string()))
    }

    /// Heartbeat period advertised in a `REGISTER_REPLY`. A reply without
    /// the field, or with 0, means the router sends no heartbeats.
    pub fn advertised_heartbeat(&self) -> Option<Duration> {
        let raw = read_u32_payload(self.payload.get(4..8)?).ok()?;
        (raw > 0).then(|| Duration::from_millis(u64::from(raw)))
    }

    /// Code and detail of an `ERROR` frame.
    pub fn error_details(&self) -> Result<(ErrorCode, String), WireError> {
        if self.payload.len() < 4 {
            return Err(WireError::Malformed("error payload shorter than 4 bytes".into()));
        }
        let mut buf = &self.payload[..];
        let raw = buf.get_u32();
        let code = ErrorCode::from_u32(raw)
            .ok_or_else(|| WireError::Malformed(format!("unknown error code {raw}")))?;
        Ok((code, String::from_utf8_lossy(buf).into_owned()))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} {}->{} ({} bytes{})",
            self.kind,
            self.message_id,
            self.source,
            self.destination,
            self.payload.len(),
            if self.one_way { ", one-way" } else { "" }
        )
    }
}

fn read_u32_payload(payload: &[u8]) -> Result<u32, WireError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| WireError::Malformed(format!("expected 4-byte payload, got {}", payload.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decoded fixed header: everything but the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub message_id: u32,
    pub source: u32,
    pub destination: u32,
    pub one_way: bool,
    pub payload_len: u32,
}

/// Decode and validate a frame header.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<Header, WireError> {
    let mut buf = &header[..];
    let raw_kind = buf.get_u8();
    let kind = MessageType::from_u8(raw_kind)
        .ok_or_else(|| WireError::Malformed(format!("unknown message type {raw_kind}")))?;
    let message_id = buf.get_u32();
    let source = buf.get_u32();
    let destination = buf.get_u32();
    let one_way = match buf.get_u8() {
        0 => false,
        1 => true,
        other => return Err(WireError::Malformed(format!("invalid oneWay flag {other}"))),
    };
    let payload_len = buf.get_u32();
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(WireError::MessageTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(Header {
        kind,
        message_id,
        source,
        destination,
        one_way,
        payload_len,
    })
}

/// Encode a frame (header + payload).
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    buf.put_u8(frame.kind as u8);
    buf.put_u32(frame.message_id);
    buf.put_u32(frame.source);
    buf.put_u32(frame.destination);
    buf.put_u8(u8::from(frame.one_way));
    buf.put_u32(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
    buf.freeze()
}

/// Decode a complete frame from a buffer holding exactly one frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let header: &[u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| WireError::Malformed("frame shorter than header".into()))?;
    let header = decode_header(header)?;
    let body = &bytes[HEADER_LEN..];
    if body.len() != header.payload_len as usize {
        return Err(WireError::Malformed(format!(
            "payload length {} does not match header {}",
            body.len(),
            header.payload_len
        )));
    }
    Ok(header.into_frame(Bytes::copy_from_slice(body)))
}

impl Header {
    pub fn into_frame(self, payload: Bytes) -> Frame {
        Frame {
            kind: self.kind,
            message_id: self.message_id,
            source: self.source,
            destination: self.destination,
            one_way: self.one_way,
            payload,
        }
    }
}

/// A registered agent, as reported in `LIST_REPLY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub agent_id: AgentId,
    pub reserved: bool,
    /// Time since the router last heard from the agent, in milliseconds.
    pub idle_ms: u32,
    /// Remote endpoint of the agent's connection, as seen by the router.
    pub endpoint: String,
}

/// Encode descriptors: `count:u32` then `id:u32 reserved:u8 idle_ms:u32 len:u16 endpoint`.
pub fn encode_agent_list(agents: &[AgentDescriptor]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(agents.len() as u32);
    for agent in agents {
        let endpoint = agent.endpoint.as_bytes();
        let len = endpoint.len().min(u16::MAX as usize);
        buf.put_u32(agent.agent_id.get());
        buf.put_u8(u8::from(agent.reserved));
        buf.put_u32(agent.idle_ms);
        buf.put_u16(len as u16);
        buf.put_slice(&endpoint[..len]);
    }
    buf.freeze()
}

pub fn decode_agent_list(payload: &[u8]) -> Result<Vec<AgentDescriptor>, WireError> {
    let truncated = || WireError::Malformed("truncated agent list".into());
    let mut buf = payload;
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let count = buf.get_u32();
    let mut agents = Vec::new();
    for _ in 0..count {
        if buf.remaining() < 11 {
            return Err(truncated());
        }
        let raw_id = buf.get_u32();
        let reserved = buf.get_u8() != 0;
        let idle_ms = buf.get_u32();
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(truncated());
        }
        let endpoint = String::from_utf8_lossy(&buf[..len]).into_owned();
        buf.advance(len);
        agents.push(AgentDescriptor {
            agent_id: AgentId::new(raw_id).map_err(|e| WireError::Malformed(e.to_string()))?,
            reserved,
            idle_ms,
            endpoint,
        });
    }
    Ok(agents)
}
