//! Sync Codec
//!
//! Length-prefixed bincode framing. Encoding and decoding are plain
//! functions over byte slices; the async helpers only move bytes.

use super::types::{Message, SyncError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Encode a message as a u32 big-endian length prefix followed by the body.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, SyncError> {
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge(data.len()));
    }
    let len = data.len() as u32;

    let mut result = Vec::with_capacity(4 + data.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&data);

    Ok(result)
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Decode a message body (without the length prefix).
pub fn decode_message(data: &[u8]) -> Result<Message, SyncError> {
    Ok(bincode::deserialize(data)?)
}

/// Write one framed message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), SyncError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_message(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Returns `None` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, SyncError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = decode_length(&len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    decode_message(&data).map(Some)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::sync::types::Handshake;

    #[test]
    fn test_encode_has_length_prefix() {
        let encoded = encode_message(&Message::Goodbye).unwrap();
        let len = decode_length(&[encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);
        assert_eq!(decode_message(&encoded[4..]).unwrap(), Message::Goodbye);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_message(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip_and_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let hello = Message::Hello(Handshake {
            zone: "east".to_string(),
            instance_id: "zone-cp-1".to_string(),
            version: "0.1.0".to_string(),
            store_id: "store".to_string(),
        });

        write_message(&mut a, &hello).await.unwrap();
        write_message(&mut a, &Message::Heartbeat { sent_at: 5 }).await.unwrap();
        drop(a);

        assert_eq!(read_message(&mut b).await.unwrap(), Some(hello));
        assert_eq!(
            read_message(&mut b).await.unwrap(),
            Some(Message::Heartbeat { sent_at: 5 })
        );
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let encoded = encode_message(&Message::Heartbeat { sent_at: 9 }).unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&encoded[..2])
            .read(&encoded[2..6])
            .read(&encoded[6..])
            .build();

        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::Heartbeat { sent_at: 9 })
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32) + 1;
        a.write_all(&len.to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_message(&mut b).await,
            Err(SyncError::FrameTooLarge(_))
        ));
    }
}
