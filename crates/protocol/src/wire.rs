//! Length-prefixed wire format for capture-agent messages.
//!
//! # Wire format
//!
//! ```text
//! PER MESSAGE (both directions):
//!   [4 bytes LE: payload_len]
//!   [payload_len bytes: UTF-8 JSON]
//! ```
//!
//! The prefix uses little-endian order, the byte order browsers use for
//! native messaging on every supported platform. A zero-length frame is
//! skipped. A frame longer than the configured limit is rejected as soon as
//! its prefix is read, before any payload is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default upper bound for a single frame payload (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Incremental codec for length-prefixed frames.
///
/// Decoding yields raw payloads; use [`decode_payload`] to turn one into a
/// typed message. Keeping the two steps apart lets a caller answer a frame
/// with unparseable JSON and keep reading, since the frame boundary is still
/// known.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec rejecting payloads larger than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < LENGTH_PREFIX_LEN {
                return Ok(None);
            }

            let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
            check_len(len, self.max_frame_len)?;

            if len == 0 {
                src.advance(LENGTH_PREFIX_LEN);
                continue;
            }

            let needed = LENGTH_PREFIX_LEN + len;
            if src.len() < needed {
                src.reserve(needed - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_PREFIX_LEN);
            return Ok(Some(src.split_to(len)));
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        check_len(item.len(), self.max_frame_len)?;
        dst.reserve(LENGTH_PREFIX_LEN + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Serializes a message into a frame payload.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Bytes, FramingError> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

/// Parses a frame payload into a typed message.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FramingError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Reads one frame payload from the stream.
///
/// Returns `None` on a clean EOF before the next length prefix. Zero-length
/// frames are skipped.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_len: usize,
) -> Result<Option<Vec<u8>>, FramingError> {
    loop {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        if reader.read(&mut prefix[..1]).await? == 0 {
            return Ok(None);
        }
        reader.read_exact(&mut prefix[1..]).await?;

        let len = u32::from_le_bytes(prefix) as usize;
        check_len(len, max_frame_len)?;
        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        return Ok(Some(payload));
    }
}

/// Writes one frame and flushes the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max_frame_len: usize,
) -> Result<(), FramingError> {
    check_len(payload.len(), max_frame_len)?;
    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and parses one message. Returns `None` on a clean EOF.
pub async fn read_message<R, T>(
    reader: &mut R,
    max_frame_len: usize,
) -> Result<Option<T>, FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader, max_frame_len).await? {
        Some(payload) => Ok(Some(decode_payload(&payload)?)),
        None => Ok(None),
    }
}

/// Serializes and writes one message.
pub async fn write_message<W, T>(
    writer: &mut W,
    msg: &T,
    max_frame_len: usize,
) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode_payload(msg)?;
    write_frame(writer, &payload, max_frame_len).await
}

fn check_len(len: usize, max: usize) -> Result<(), FramingError> {
    if len > max {
        return Err(FramingError::FrameTooLarge { len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CaptureResponse, DownloadRequest};
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    fn sample_request() -> DownloadRequest {
        DownloadRequest {
            url: "https://example.com/file.iso".into(),
            cookies: Some("session=abc".into()),
            referrer: None,
            user_agent: Some("Firefox/128.0".into()),
        }
    }

    #[test]
    fn prefix_is_little_endian() {
        let mut codec = FrameCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::from_static(&[0xAA; 258]), &mut dst)
            .unwrap();
        assert_eq!(&dst[..4], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(dst.len(), 4 + 258);
    }

    #[test]
    fn decoder_waits_for_complete_frame() {
        let mut codec = FrameCodec::default();
        let bytes = frame(br#"{"url":"https://example.com/a"}"#);

        let mut src = BytesMut::from(&bytes[..2]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&bytes[2..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&bytes[10..]);
        let payload = codec.decode(&mut src).unwrap().unwrap();
        let req: DownloadRequest = decode_payload(&payload).unwrap();
        assert_eq!(req.url, "https://example.com/a");
        assert!(src.is_empty());
    }

    #[test]
    fn decoder_skips_zero_length_frames() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&frame(b""));
        src.extend_from_slice(&frame(b""));
        src.extend_from_slice(&frame(b"{}"));

        let payload = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&payload[..], b"{}");
    }

    #[test]
    fn decoder_rejects_oversized_frame_from_prefix_alone() {
        let mut codec = FrameCodec::new(16);
        let mut src = BytesMut::from(&17u32.to_le_bytes()[..]);

        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            FramingError::FrameTooLarge { len: 17, max: 16 }
        ));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let mut codec = FrameCodec::new(4);
        let mut dst = BytesMut::new();
        let result = codec.encode(Bytes::from_static(b"12345"), &mut dst);
        assert!(matches!(result, Err(FramingError::FrameTooLarge { .. })));
        assert!(dst.is_empty());
    }

    #[test]
    fn invalid_json_keeps_frame_boundary() {
        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&frame(b"not json"));
        src.extend_from_slice(&frame(br#"{"url":"https://example.com/b"}"#));

        let bad = codec.decode(&mut src).unwrap().unwrap();
        assert!(matches!(
            decode_payload::<DownloadRequest>(&bad),
            Err(FramingError::InvalidPayload(_))
        ));

        let good = codec.decode(&mut src).unwrap().unwrap();
        let req: DownloadRequest = decode_payload(&good).unwrap();
        assert_eq!(req.url, "https://example.com/b");
    }

    #[tokio::test]
    async fn framed_read_handles_split_reads() {
        let first = frame(&encode_payload(&sample_request()).unwrap());
        let second = frame(br#"{"url":"https://example.com/second"}"#);

        let mock = tokio_test::io::Builder::new()
            .read(&first[..3])
            .read(&first[3..20])
            .read(&first[20..])
            .read(&second[..1])
            .read(&second[1..])
            .build();

        let mut framed = FramedRead::new(mock, FrameCodec::default());

        let p1 = framed.next().await.unwrap().unwrap();
        assert_eq!(
            decode_payload::<DownloadRequest>(&p1).unwrap(),
            sample_request()
        );

        let p2 = framed.next().await.unwrap().unwrap();
        let req: DownloadRequest = decode_payload(&p2).unwrap();
        assert_eq!(req.url, "https://example.com/second");
        assert!(req.cookies.is_none());

        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn message_roundtrip_over_stream() {
        let mut buf = Vec::new();
        write_message(&mut buf, &sample_request(), DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        write_message(
            &mut buf,
            &CaptureResponse::accepted("t-1"),
            DEFAULT_MAX_FRAME_LEN,
        )
        .await
        .unwrap();

        let mut cursor = &buf[..];
        let req: DownloadRequest = read_message(&mut cursor, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req, sample_request());

        let resp: CaptureResponse = read_message(&mut cursor, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap()
            .unwrap();
        assert!(resp.success);

        let end: Option<CaptureResponse> = read_message(&mut cursor, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized() {
        let bytes = frame(&[b'x'; 64]);
        let mut cursor = &bytes[..];
        let result = read_frame(&mut cursor, 32).await;
        assert!(matches!(
            result,
            Err(FramingError::FrameTooLarge { len: 64, max: 32 })
        ));
    }

    #[tokio::test]
    async fn read_frame_truncated_prefix_is_error() {
        let bytes = [0x05u8, 0x00];
        let mut cursor = &bytes[..];
        let result = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(FramingError::Io(_))));
    }

    #[tokio::test]
    async fn read_frame_truncated_payload_is_error() {
        let mut bytes = frame(b"{\"url\":\"x\"}");
        bytes.truncate(8);
        let mut cursor = &bytes[..];
        let result = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(FramingError::Io(_))));
    }
}
