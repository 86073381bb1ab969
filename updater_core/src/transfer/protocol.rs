//! Wire format for the folder transfer stream.
//!
//! One stream is `frame* sentinel`. A frame is a 4-byte big-endian payload
//! length followed by the payload; the sentinel is the unframed 3 ASCII
//! bytes `EOF`. The payload carries one file record in an explicit,
//! versioned schema so independent implementations can interoperate:
//!
//! ```text
//! u8  version        (= 1)
//! u32 path_len       (big-endian)
//! ..  path bytes     (UTF-8, forward-slash separators)
//! u64 data_len       (big-endian)
//! ..  data bytes
//! ```

use anyhow::{Result, bail};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version byte leading every record payload
pub const RECORD_VERSION: u8 = 1;

/// End-of-stream marker, sent once after the last frame
pub const SENTINEL: &[u8; 3] = b"EOF";

/// Upper bound on a single record payload. Guards the receiver against
/// allocating on a garbage length field.
pub const MAX_RECORD_LEN: u32 = 1024 * 1024 * 1024;

/// One file as it crosses the wire: a forward-slash relative path plus the
/// full file content. Built transiently per file, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub relative_path: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),
    #[error("record payload truncated")]
    Truncated,
    #[error("record payload has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("record path is not valid UTF-8")]
    InvalidPath(#[from] std::string::FromUtf8Error),
}

/// Serialize one file record into a version-1 payload. Pure; framing is
/// applied separately by [`write_frame`].
pub fn encode_record(relative_path: &str, content: &[u8]) -> Vec<u8> {
    let mut buf =
        BytesMut::with_capacity(1 + 4 + relative_path.len() + 8 + content.len());
    buf.put_u8(RECORD_VERSION);
    buf.put_u32(relative_path.len() as u32);
    buf.put_slice(relative_path.as_bytes());
    buf.put_u64(content.len() as u64);
    buf.put_slice(content);
    buf.to_vec()
}

/// Strict inverse of [`encode_record`]: rejects unknown versions, short
/// payloads and trailing garbage.
pub fn decode_record(payload: &[u8]) -> Result<FileRecord, RecordError> {
    let mut buf = payload;

    if buf.remaining() < 1 {
        return Err(RecordError::Truncated);
    }
    let version = buf.get_u8();
    if version != RECORD_VERSION {
        return Err(RecordError::UnsupportedVersion(version));
    }

    if buf.remaining() < 4 {
        return Err(RecordError::Truncated);
    }
    let path_len = buf.get_u32() as usize;
    if buf.remaining() < path_len {
        return Err(RecordError::Truncated);
    }
    let relative_path = String::from_utf8(buf.copy_to_bytes(path_len).to_vec())?;

    if buf.remaining() < 8 {
        return Err(RecordError::Truncated);
    }
    let data_len = buf.get_u64() as usize;
    if buf.remaining() < data_len {
        return Err(RecordError::Truncated);
    }
    let content = buf.copy_to_bytes(data_len).to_vec();

    if buf.has_remaining() {
        return Err(RecordError::TrailingBytes(buf.remaining()));
    }

    Ok(FileRecord {
        relative_path,
        content,
    })
}

/// Write one length-prefixed frame: 4-byte big-endian length, then the
/// payload.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    w.write_all(&len).await?;
    w.write_all(payload).await?;
    Ok(())
}

/// Write the end-of-stream sentinel.
pub async fn write_sentinel<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(SENTINEL).await?;
    Ok(())
}

/// Read the next record from the stream, or `None` on the sentinel.
///
/// The sentinel is shorter than a length field, so the reader takes 3
/// bytes first and only completes the 4-byte length when they are not the
/// marker. Framing does not resynchronize: any malformed frame is an error
/// that ends the stream.
pub async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<FileRecord>> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head[..3]).await?;
    if &head[..3] == SENTINEL {
        return Ok(None);
    }
    r.read_exact(&mut head[3..]).await?;

    let len = u32::from_be_bytes(head);
    if len > MAX_RECORD_LEN {
        bail!("frame length {len} exceeds the {MAX_RECORD_LEN} byte record limit");
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(decode_record(&payload)?))
}
