//! Codec errors.

use pamr_types::PamrError;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl From<WireError> for PamrError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => PamrError::Io(e),
            WireError::ConnectionClosed => PamrError::ConnectionLost,
            other @ (WireError::MessageTooLarge { .. } | WireError::Malformed(_)) => {
                PamrError::ProtocolViolation(other.to_string())
            }
        }
    }
}
