//! Async frame I/O over any byte stream.

use crate::error::WireError;
use crate::message::{decode_header, encode_frame, Frame, HEADER_LEN};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode_frame(frame);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// A clean EOF before the header is reported as [`WireError::ConnectionClosed`].
/// EOF in the middle of a frame is a truncated frame and surfaces as I/O error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let header = decode_header(&header)?;
    let mut body = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut body).await?;

    Ok(header.into_frame(Bytes::from(body)))
}
