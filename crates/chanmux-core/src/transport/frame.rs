//! Length-prefixed framing for stream transports.
//!
//! ```text
//! [u32 BE: len][UTF-8 payload of len bytes]
//! ```

use crate::config::TransportConfig;
use crate::{MuxError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame from an async reader.
///
/// Returns `None` on clean EOF at a frame boundary (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > TransportConfig::MAX_FRAME_SIZE {
        return Err(MuxError::FrameTooLarge {
            size: len,
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| MuxError::Protocol {
            message: "Invalid UTF-8 in frame".to_string(),
        })
}

/// Write one frame to an async writer and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &str) -> Result<()> {
    if payload.len() > TransportConfig::MAX_FRAME_SIZE {
        return Err(MuxError::FrameTooLarge {
            size: payload.len(),
            max: TransportConfig::MAX_FRAME_SIZE,
        });
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
