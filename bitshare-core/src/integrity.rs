//! Integrity: per-chunk SHA-256 checksums, hex encoded.

use std::io::SeekFrom;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Read buffer used when hashing a range of a file.
pub const HASH_BUF_SIZE: usize = 64 * 1024;

/// Hash a chunk payload. Returns the lowercase hex digest.
pub fn hash_chunk(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Verify chunk payload against an expected hex digest (case-insensitive).
pub fn verify_chunk(payload: &[u8], expected: &str) -> bool {
    hash_chunk(payload).eq_ignore_ascii_case(expected)
}

/// Hash exactly `size` bytes starting at `offset`. Fails with `UnexpectedEof` if the range is short.
pub async fn hash_range<R>(reader: &mut R, offset: u64, size: u64) -> std::io::Result<String>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    reader.seek(SeekFrom::Start(offset)).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(HASH_BUF_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}
