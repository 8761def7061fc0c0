//! Length-prefixed framing: a 4-byte little-endian payload length followed
//! by that many bytes of JSON.

use crate::error::{ProtocolError, Result};
use crate::message::{decode_payload, encode_payload, SyncMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_BYTES: usize = 4;
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

pub fn encode_frame(message: &SyncMessage) -> Result<Vec<u8>> {
    let payload = encode_payload(message)?;
    let len = checked_len(payload.len())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn checked_len(len: usize) -> Result<u32> {
    if len > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }
    u32::try_from(len).map_err(|_| ProtocolError::MessageTooLarge {
        len,
        max: MAX_MESSAGE_BYTES,
    })
}

/// Reads one frame. `Ok(None)` means the peer closed the stream on a frame
/// boundary; a close mid-frame is an IO error.
///
/// Oversized lengths are rejected before any payload byte is consumed, so the
/// stream must be dropped afterwards.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<SyncMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_BYTES];
    let mut filled = 0;
    while filled < FRAME_HEADER_BYTES {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame header",
            )));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: MAX_MESSAGE_BYTES,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, message: &SyncMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_is_little_endian_payload_length() {
        let frame = encode_frame(&SyncMessage::invalidate("a.example")).expect("encode");
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_BYTES);
    }

    #[test]
    fn oversized_outgoing_message_is_refused() {
        let message = SyncMessage::invalidate("x".repeat(MAX_MESSAGE_BYTES));
        let err = encode_frame(&message).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::MessageTooLarge);
    }

    #[tokio::test]
    async fn reads_consecutive_frames_then_clean_eof() {
        let mut bytes = encode_frame(&SyncMessage::invalidate("a.example")).expect("encode");
        bytes.extend(encode_frame(&SyncMessage::invalidate("b.example")).expect("encode"));
        let mut reader = bytes.as_slice();

        let first = read_frame(&mut reader).await.expect("first").expect("frame");
        let second = read_frame(&mut reader).await.expect("second").expect("frame");
        assert_eq!(first.domain(), "a.example");
        assert_eq!(second.domain(), "b.example");
        assert!(read_frame(&mut reader).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_without_reading_payload() {
        let len = u32::try_from(MAX_MESSAGE_BYTES + 1).expect("fits");
        let mut bytes = len.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{\"type\":\"invalidate\"");
        let mut reader = bytes.as_slice();

        let err = read_frame(&mut reader).await.expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::MessageTooLarge);
        // payload untouched
        assert_eq!(reader.len(), 20);
    }

    #[tokio::test]
    async fn truncated_header_is_an_io_error() {
        let mut reader: &[u8] = &[3, 0];
        let err = read_frame(&mut reader).await.expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }

    #[tokio::test]
    async fn write_then_read_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let message = SyncMessage::Query {
            correlation_id: 1,
            domain: "shop.example".to_string(),
        };
        write_frame(&mut client, &message).await.expect("write");
        let received = read_frame(&mut server).await.expect("read").expect("frame");
        assert_eq!(received, message);
    }
}
