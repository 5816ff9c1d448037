//! Framing: 4-byte big-endian length prefix + payload.
//!
//! Sync helpers work on byte buffers; async helpers drive any tokio stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 100 * 1024 * 1024; // 100 MiB

/// Default bound on silence between two frames.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Encode a payload into a single frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// A zero-length frame decodes to an empty payload; callers skip it.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = LEN_SIZE + len as usize;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..end], end))
}

/// Error decoding a frame from a buffer.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large ({0} bytes)")]
    TooLarge(u32),
}

/// Error reading or writing frames on a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared length over `MAX_FRAME_LEN`. Terminates the connection.
    #[error("frame too large ({0} bytes)")]
    TooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no frame within {0:?}")]
    IdleTimeout(Duration),
}

/// Read one frame. `Ok(None)` on clean EOF before a length prefix.
/// A zero-length frame is returned as an empty payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Read the next non-empty frame, each read bounded by `idle`.
/// The deadline restarts after every frame, including skipped empty ones.
pub async fn read_frame_idle<R>(
    reader: &mut R,
    idle: Duration,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match tokio::time::timeout(idle, read_frame(reader)).await {
            Err(_) => return Err(FrameError::IdleTimeout(idle)),
            Ok(Ok(Some(payload))) if payload.is_empty() => continue,
            Ok(other) => return other,
        }
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..LEN_SIZE], &[0, 0, 0, 3]);
        assert_eq!(&frame[LEN_SIZE..], b"abc");
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(br#"{"type":"PING"}"#).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let fa = encode_frame(b"first").unwrap();
        let fb = encode_frame(&[0x01, 0x02]).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (p1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(p1, b"first");
        assert_eq!(n1, fa.len());
        let (p2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(p2, &[0x01, 0x02]);
        assert_eq!(n2, fb.len());
    }

    #[test]
    fn oversized_header_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_be_bytes();
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn empty_frames_are_skipped() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&encode_frame(b"after").unwrap());
        let mut reader = &buf[..];
        let got = read_frame_idle(&mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some(&b"after"[..]));
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_terminates() {
        let buf = (MAX_FRAME_LEN + 1).to_be_bytes();
        let mut reader = &buf[..];
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn silent_stream_times_out() {
        let (mut a, _b) = tokio::io::duplex(64);
        let res = read_frame_idle(&mut a, Duration::from_millis(50)).await;
        assert!(matches!(res, Err(FrameError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn write_then_read_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello"[..]));
    }
}
