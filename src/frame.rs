//! Versioned, length-prefixed framing shared by the peer and tracker protocols.
//!
//! Layout: `<version: u8><tag: u8><payload length: u32 BE><payload>`.

use crate::error::{Result, SwarmError};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_VERSION: u8 = 1;

/// Header size: version + tag + length
pub const HEADER_LEN: usize = 6;

/// Largest payload accepted on either protocol (2 MiB)
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    pub fn empty(tag: u8) -> Self {
        Self::new(tag, Bytes::new())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_FRAME_LEN {
            return Err(SwarmError::ProtocolError(format!(
                "Frame payload of {} bytes exceeds limit",
                self.payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(self.tag);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];

    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let version = header[0];
    if version != FRAME_VERSION {
        return Err(SwarmError::ProtocolError(format!(
            "Unsupported frame version: {}",
            version
        )));
    }

    let tag = header[1];
    let length = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if length > MAX_FRAME_LEN {
        return Err(SwarmError::ProtocolError(format!(
            "Frame length {} exceeds limit",
            length
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame::new(tag, payload)))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
