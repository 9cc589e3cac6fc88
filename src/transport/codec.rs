//! Frame codec for stream transports.
//!
//! Frame format:
//! ```text
//! ┌──────────┬────────────────────────┐
//! │ len (4B) │   envelope bytes       │
//! │ u32 BE   │                        │
//! └──────────┴────────────────────────┘
//! ```
//! Length covers the envelope bytes only, not the 4-byte prefix.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF at a frame boundary.
/// `max_frame_bytes` caps the accepted payload size.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes (max {})", frame_len, max_frame_bytes),
        ));
    }

    let mut payload = vec![0u8; frame_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Frame too large to encode: {} bytes", payload.len()),
        )
    })?;
    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
