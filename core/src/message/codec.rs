// Frame codec — u32 length-prefixed frames with size limits to prevent abuse

use super::types::PeerFrame;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Headroom added on top of the object size limit for envelope fields
pub const FRAME_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("Empty frame")]
    Empty,
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

impl FrameError {
    /// Peer closed the stream between frames
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Write one frame: big-endian u32 length, then the body
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max_len: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.is_empty() {
        return Err(FrameError::Empty);
    }
    if body.len() > max_len {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max: max_len,
        });
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, rejecting declared lengths above `max_len` before allocating
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Bytes of a peer frame that identify a request or response: the bincode
/// variant index (u32) followed by the envelope's leading `request_id` (u64)
const ENVELOPE_HEADER_LEN: usize = 12;
const REQUEST_TAG: u32 = 3;
const RESPONSE_TAG: u32 = 4;

/// A frame whose body was discarded because it exceeded the read limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkippedFrame {
    Request { request_id: u64, len: usize },
    Response { request_id: u64, len: usize },
    /// Not an envelope; the stream is still aligned but nothing can be answered
    Other { len: usize },
}

/// Result of [`read_frame_or_skip`]
#[derive(Debug)]
pub enum InboundFrame {
    Body(Vec<u8>),
    Skipped(SkippedFrame),
}

/// Read one peer frame. A declared length above `max_len` is not fatal:
/// the envelope header is kept, the rest of the body is drained and
/// dropped, and the stream stays usable for the next frame.
pub async fn read_frame_or_skip<R>(reader: &mut R, max_len: usize) -> Result<InboundFrame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len <= max_len {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        return Ok(InboundFrame::Body(buf));
    }

    let mut header = [0u8; ENVELOPE_HEADER_LEN];
    let head_len = len.min(ENVELOPE_HEADER_LEN);
    reader.read_exact(&mut header[..head_len]).await?;
    let rest = (len - head_len) as u64;
    let drained = tokio::io::copy(&mut reader.take(rest), &mut tokio::io::sink()).await?;
    if drained < rest {
        return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    let skipped = match bincode::deserialize::<(u32, u64)>(&header[..head_len]) {
        Ok((REQUEST_TAG, request_id)) => SkippedFrame::Request { request_id, len },
        Ok((RESPONSE_TAG, request_id)) => SkippedFrame::Response { request_id, len },
        _ => SkippedFrame::Other { len },
    };
    Ok(InboundFrame::Skipped(skipped))
}

/// Serialize a peer frame (bincode)
pub fn encode_peer_frame(frame: &PeerFrame) -> Result<Vec<u8>, FrameError> {
    bincode::serialize(frame).map_err(|e| FrameError::Encode(e.to_string()))
}

pub fn decode_peer_frame(bytes: &[u8]) -> Result<PeerFrame, FrameError> {
    bincode::deserialize(bytes).map_err(|e| FrameError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EndpointId;
    use crate::message::types::{Operation, RequestEnvelope, ResponseEnvelope};

    #[tokio::test]
    async fn test_frames_preserve_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first", 64).await.unwrap();
        write_frame(&mut a, b"second", 64).await.unwrap();
        assert_eq!(read_frame(&mut b, 64).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut b, 64).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_reject_oversized_declared_length() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_u32(1_000_000).await.unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 1_000_000, max: 1024 }));
    }

    #[tokio::test]
    async fn test_reject_oversized_write() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = write_frame(&mut a, &[0u8; 65], 64).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 65, max: 64 }));
    }

    #[tokio::test]
    async fn test_eof_detected() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[test]
    fn test_peer_frame_codec() {
        let frame = PeerFrame::Request(RequestEnvelope {
            request_id: 7,
            operation: Operation::Put,
            object_id: "obj".into(),
            payload: Some(vec![1, 2, 3]),
            deadline_ms: 500,
        });
        let bytes = encode_peer_frame(&frame).unwrap();
        assert_eq!(decode_peer_frame(&bytes).unwrap(), frame);

        let hello = PeerFrame::HelloAck {
            endpoint_id: EndpointId::generate(),
            max_object_size: 1 << 20,
        };
        assert_eq!(decode_peer_frame(&encode_peer_frame(&hello).unwrap()).unwrap(), hello);
        assert!(decode_peer_frame(&[0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_oversized_request_skipped_and_stream_stays_aligned() {
        let request = PeerFrame::Request(RequestEnvelope {
            request_id: 41,
            operation: Operation::Put,
            object_id: "big".into(),
            payload: Some(vec![7u8; 4096]),
            deadline_ms: 1000,
        });
        let small = PeerFrame::Response(ResponseEnvelope::not_found(42));
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, &encode_peer_frame(&request).unwrap(), 1 << 16).await.unwrap();
        write_frame(&mut a, &encode_peer_frame(&small).unwrap(), 1 << 16).await.unwrap();

        match read_frame_or_skip(&mut b, 1024).await.unwrap() {
            InboundFrame::Skipped(SkippedFrame::Request { request_id, len }) => {
                assert_eq!(request_id, 41);
                assert!(len > 4096);
            }
            other => panic!("expected skipped request, got {:?}", other),
        }
        match read_frame_or_skip(&mut b, 1024).await.unwrap() {
            InboundFrame::Body(bytes) => assert_eq!(decode_peer_frame(&bytes).unwrap(), small),
            other => panic!("expected body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_response_keeps_request_id() {
        let response = PeerFrame::Response(ResponseEnvelope::ok(9, Some(vec![1u8; 2048])));
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        write_frame(&mut a, &encode_peer_frame(&response).unwrap(), 1 << 16).await.unwrap();
        let skipped = read_frame_or_skip(&mut b, 512).await.unwrap();
        assert!(matches!(
            skipped,
            InboundFrame::Skipped(SkippedFrame::Response { request_id: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_oversized_frame_is_eof() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        a.write_u32(5000).await.unwrap();
        a.write_all(&[0u8; 100]).await.unwrap();
        drop(a);
        let err = read_frame_or_skip(&mut b, 1024).await.unwrap_err();
        assert!(err.is_eof());
    }
}
