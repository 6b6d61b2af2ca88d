//! Framing logic shared by the server, the client, and the discovery path
//!
//! This module provides transport-agnostic helpers so that every channel
//! (plain TCP, TLS, tests) builds and validates frames the same way.

use anyhow::{bail, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms};

/// Frame header length: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const FRAME_HEADER_LEN: usize = 11;

/// Any reliable ordered byte stream the framed protocol can ride on
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Plain TCP or TLS, behind one type
pub type BoxedStream = Box<dyn AsyncStream>;

/// Read one frame. The header read blocks for as long as the peer stays
/// idle; the payload, once announced, must arrive under a deadline.
pub async fn read_frame<S>(stream: &mut S) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut hdr).await?;
    let (typ, len_u32) = parse_frame_header(&hdr)?;
    let len = len_u32 as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        let ms = read_deadline_ms(len);
        match timeout(Duration::from_millis(ms), stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("frame payload timeout ({} ms)", ms),
        }
    }
    Ok((typ, payload))
}

/// Write one frame under a size-scaled deadline.
pub async fn write_frame<S>(stream: &mut S, frame_type: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let hdr = build_frame_header(frame_type, payload.len() as u32);
    let ms = write_deadline_ms(payload.len());
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await
    })
    .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("frame write timeout ({} ms)", ms),
    }
}

/// Validate frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > crate::protocol::MAX_FRAME_SIZE {
        bail!(
            "frame payload too large: {} bytes (max: {})",
            size,
            crate::protocol::MAX_FRAME_SIZE
        );
    }
    Ok(())
}

/// Build frame header (11 bytes)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; FRAME_HEADER_LEN] {
    use crate::protocol::{MAGIC, VERSION};

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(u8, u32)> {
    use crate::protocol::{MAGIC, VERSION};

    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_frame_header_round_trip() {
        let frame_type = crate::protocol::frame::REQUEST;
        let payload_len = 12345u32;

        let header = build_frame_header(frame_type, payload_len);
        let (parsed_type, parsed_len) = parse_frame_header(&header).unwrap();

        assert_eq!(parsed_type, frame_type);
        assert_eq!(parsed_len, payload_len);
    }

    #[test]
    fn test_parse_frame_header_invalid_magic() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(b"WRNG");
        header[4..6].copy_from_slice(&1u16.to_le_bytes());
        header[6] = 1;
        header[7..11].copy_from_slice(&100u32.to_le_bytes());

        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_parse_frame_header_wrong_version() {
        use crate::protocol::MAGIC;

        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&999u16.to_le_bytes());
        header[6] = 1;
        header[7..11].copy_from_slice(&100u32.to_le_bytes());

        assert!(parse_frame_header(&header).is_err());
    }

    #[test]
    fn test_validate_frame_size() {
        assert!(validate_frame_size(0).is_ok());
        assert!(validate_frame_size(1024).is_ok());
        assert!(validate_frame_size(crate::protocol::MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(crate::protocol::MAX_FRAME_SIZE + 1).is_err());
        assert!(validate_frame_size(usize::MAX).is_err());
    }

    #[test]
    fn test_ensure_dir_exists() {
        let temp_dir = TempDir::new().unwrap();
        let new_dir = temp_dir.path().join("new").join("nested").join("dir");

        assert!(!new_dir.exists());
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.exists());
        assert!(new_dir.is_dir());

        // Should be idempotent
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.exists());
    }

    #[test]
    fn test_ensure_parent_exists() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("new").join("nested").join("file.txt");

        assert!(!file_path.parent().unwrap().exists());
        ensure_parent_exists(&file_path).unwrap();
        assert!(file_path.parent().unwrap().exists());
        assert!(file_path.parent().unwrap().is_dir());
    }
}
