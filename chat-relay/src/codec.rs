//! Length-prefixed framing over a boundary-less byte stream.
//!
//! Every frame is a 4-byte big-endian payload length followed by the payload
//! itself. A single `read` on a TCP stream may return half a frame or several
//! frames glued together, so readers always pull exactly the prefix and then
//! exactly the payload.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, RelayResult};

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound on an inbound payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// One encoded frame (prefix included), cheap to clone across recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    encoded: Bytes,
}

impl Frame {
    pub fn encode(payload: impl AsRef<[u8]>) -> RelayResult<Self> {
        let payload = payload.as_ref();
        let len = u32::try_from(payload.len()).map_err(|_| RelayError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.put_u32(len);
        buf.put_slice(payload);
        Ok(Self {
            encoded: buf.freeze(),
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.encoded[LENGTH_PREFIX_LEN..]
    }

    /// The bytes that go on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }
}

/// Reads the next frame payload from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly between two frames. A
/// stream that ends part-way through a frame, or any transport error, yields
/// [`RelayError::ConnectionClosed`]. A declared length above `max_len` fails
/// with [`RelayError::FrameTooLarge`] without consuming the payload.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> RelayResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let read = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(|_| RelayError::ConnectionClosed)?;
        if read == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(RelayError::ConnectionClosed)
            };
        }
        filled += read;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(RelayError::FrameTooLarge { len, max: max_len });
    }

    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| RelayError::ConnectionClosed)?;
    Ok(Some(payload.freeze()))
}

/// Writes one frame and flushes so peers see it immediately.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = Frame::encode("hi").expect("encode");
        assert_eq!(frame.as_bytes(), &[0, 0, 0, 2, b'h', b'i']);
        assert_eq!(frame.payload(), b"hi");
    }

    #[tokio::test]
    async fn frames_survive_random_chunking() {
        let messages: Vec<String> = (0..200).map(|i| format!("message number {i}")).collect();
        let mut wire = Vec::new();
        for message in &messages {
            wire.extend_from_slice(Frame::encode(message).expect("encode").as_bytes());
        }
        // Keepalives are frames too.
        wire.extend_from_slice(Frame::encode("").expect("encode").as_bytes());

        let (mut writer, mut reader) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(0x5eed);
            let mut offset = 0;
            while offset < wire.len() {
                let end = (offset + rng.gen_range(1..=11)).min(wire.len());
                writer.write_all(&wire[offset..end]).await.expect("write slice");
                writer.flush().await.expect("flush");
                offset = end;
            }
        });

        for expected in &messages {
            let payload = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
                .await
                .expect("read frame")
                .expect("frame present");
            assert_eq!(payload.as_ref(), expected.as_bytes());
        }
        let keepalive = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("read keepalive")
            .expect("keepalive present");
        assert!(keepalive.is_empty());

        feeder.await.expect("feeder task");
        let end = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("clean end");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn coalesced_frames_are_split_apart() {
        let mut wire = Vec::new();
        wire.extend_from_slice(Frame::encode("one").expect("encode").as_bytes());
        wire.extend_from_slice(Frame::encode("two").expect("encode").as_bytes());
        let mut reader = wire.as_slice();

        let first = read_frame(&mut reader, 16).await.expect("first").expect("some");
        let second = read_frame(&mut reader, 16).await.expect("second").expect("some");
        assert_eq!(first.as_ref(), b"one");
        assert_eq!(second.as_ref(), b"two");
        assert!(read_frame(&mut reader, 16).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let frame = Frame::encode(vec![b'x'; 33]).expect("encode");
        let mut reader = frame.as_bytes();

        let err = read_frame(&mut reader, 32).await.expect_err("too large");
        assert!(matches!(err, RelayError::FrameTooLarge { len: 33, max: 32 }));
    }

    #[tokio::test]
    async fn truncated_frame_reports_closed_connection() {
        let frame = Frame::encode("truncated").expect("encode");
        let bytes = frame.as_bytes();

        let mut mid_payload = &bytes[..bytes.len() - 2];
        let err = read_frame(&mut mid_payload, 64).await.expect_err("mid payload");
        assert!(matches!(err, RelayError::ConnectionClosed));

        let mut mid_prefix = &bytes[..2];
        let err = read_frame(&mut mid_prefix, 64).await.expect_err("mid prefix");
        assert!(matches!(err, RelayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn write_frame_round_trips_through_duplex() {
        let (mut writer, mut reader) = tokio::io::duplex(16);
        let frame = Frame::encode("Connected to the server!").expect("encode");

        let send = tokio::spawn(async move { write_frame(&mut writer, &frame).await });
        let payload = read_frame(&mut reader, 64)
            .await
            .expect("read")
            .expect("frame present");
        send.await.expect("join").expect("write");

        assert_eq!(payload.as_ref(), b"Connected to the server!");
    }
}
