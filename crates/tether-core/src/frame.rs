use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pool::{BufferPool, PooledBuf};

/// Length of the big-endian `u32` prefix in front of every frame.
pub const LEN_PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("frame length {len} exceeds the {max} byte limit")]
    Oversize { len: u64, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` for a zero-length frame, which is a keep-alive and
/// carries no envelope. Both the prefix and the payload are read to
/// completion; an end-of-stream in either position maps to
/// [`FrameError::ConnectionClosed`]. A prefix whose signed interpretation is
/// negative, or that exceeds `max_len`, is rejected before any payload byte
/// is read.
pub async fn read_frame<R>(
    reader: &mut R,
    pool: &BufferPool,
    max_len: usize,
) -> Result<Option<PooledBuf>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX_LEN];
    read_fully(reader, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix);

    if len > i32::MAX as u32 || len as usize > max_len {
        return Err(FrameError::Oversize {
            len: u64::from(len),
            max: max_len,
        });
    }
    if len == 0 {
        return Ok(None);
    }

    let mut buf = pool.take(len as usize);
    read_fully(reader, &mut buf).await?;
    Ok(Some(buf))
}

/// Write one frame: prefix and body as a single contiguous write, then flush.
///
/// Exclusive access to the writer is the caller's responsibility (the
/// per-connection send mutex).
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max_len {
        return Err(FrameError::Oversize {
            len: body.len() as u64,
            max: max_len,
        });
    }
    let mut framed = Vec::with_capacity(LEN_PREFIX_LEN + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(body);
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a zero-length keep-alive frame.
pub async fn write_keep_alive<W>(writer: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&0u32.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ConnectionClosed
        } else {
            FrameError::Io(err)
        }
    })?;
    Ok(())
}
