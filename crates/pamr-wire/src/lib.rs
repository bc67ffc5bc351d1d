//! PAMR wire protocol.
//!
//! Every exchange between a router and its agents is a binary frame:
//!
//! ```text
//! type:u8 | messageID:u32 | source:u32 | destination:u32 | oneWay:u8 | payloadLength:u32 | payload
//! ```
//!
//! All integers are big-endian. The router never looks inside `DATA`
//! payloads; it only reads the header to route them.
//!
//! - [`message`]: frame model, error codes and agent-list descriptors
//! - [`framing`]: async reader/writer over any byte stream

pub mod error;
pub mod framing;
pub mod message;

pub use error::WireError;
pub use framing::{read_frame, write_frame};
pub use message::{AgentDescriptor, ErrorCode, Frame, MessageType, MAX_PAYLOAD_SIZE};
