//! Length-prefixed message framing.
//!
//! Every wire message is a 4-byte big-endian length followed by a postcard
//! body. The length cap is enforced before any allocation; a peer announcing
//! an oversized frame is a protocol violation and the connection is closed.

use crate::net::message::Message;
use crate::net::serde_safe::{from_bytes, to_bytes};
use crate::types::MAX_FRAME_SIZE;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed message: {0}")]
    Codec(#[from] postcard::Error),
}

impl FrameError {
    /// True when the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, FrameError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
        ))
    }
}

/// Read one framed message.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message, FrameError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let msg = from_bytes::<Message>(&body)?;
    trace!("frame in: id={} {} bytes", msg.id, len);
    Ok(msg)
}

/// Serialize and write one framed message.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), FrameError> {
    let body = to_bytes(msg)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }

    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    trace!("frame out: id={} {} bytes", msg.id, body.len());
    Ok(())
}

/// Serialized body size of a message, used by the replication batcher to pack
/// updates just under the frame cap.
pub fn encoded_size(msg: &Message) -> Result<usize, FrameError> {
    Ok(to_bytes(msg)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::message::{Body, Request, SingleRequest};
    use crate::net::serde_safe::BoundedBytes;

    fn ping(id: u32) -> Message {
        Message {
            id,
            body: Body::Request(Request::Single(SingleRequest::Ping(
                BoundedBytes::new_unchecked(b"hello".to_vec()),
            ))),
        }
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let msg = ping(7);
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = io::Cursor::new(buf);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded.id, 7);
    }

    #[tokio::test]
    async fn test_roundtrip_bit_identical() {
        let msg = ping(42);
        let mut first = Vec::new();
        write_message(&mut first, &msg).await.unwrap();

        let mut cursor = io::Cursor::new(first.clone());
        let decoded = read_message(&mut cursor).await.unwrap();

        let mut second = Vec::new();
        write_message(&mut second, &decoded).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_read() {
        // Announces a 2 MiB body but carries none; the cap must trip on the
        // prefix alone.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(2u32 * 1024 * 1024).to_be_bytes());

        let mut cursor = io::Cursor::new(buf);
        match read_message(&mut cursor).await {
            Err(FrameError::TooLarge(n)) => assert_eq!(n, 2 * 1024 * 1024),
            other => panic!("expected TooLarge, got {:?}", other.map(|m| m.id)),
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_disconnect() {
        let msg = ping(1);
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = io::Cursor::new(buf);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
