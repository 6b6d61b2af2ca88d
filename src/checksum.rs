//! Transfer integrity checksums
//!
//! Every file crossing a side channel is followed by a 4-byte big-endian
//! CRC32 trailer. The hasher is fed chunk by chunk as bytes are streamed,
//! so no extra pass over the file is needed.

pub const CRC_TRAILER_LEN: usize = 4;

/// Streaming CRC32 over one file's content bytes
pub struct TransferChecksum {
    hasher: crc32fast::Hasher,
}

impl TransferChecksum {
    pub fn new() -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Wire form of the trailer
    pub fn trailer(self) -> [u8; CRC_TRAILER_LEN] {
        self.hasher.finalize().to_be_bytes()
    }

    pub fn value(self) -> u32 {
        self.hasher.finalize()
    }
}

impl Default for TransferChecksum {
    fn default() -> Self {
        Self::new()
    }
}

pub fn parse_trailer(trailer: &[u8; CRC_TRAILER_LEN]) -> u32 {
    u32::from_be_bytes(*trailer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunked_equals_whole() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let mut whole = TransferChecksum::new();
        whole.update(data);

        let mut chunked = TransferChecksum::new();
        for part in data.chunks(7) {
            chunked.update(part);
        }
        assert_eq!(whole.value(), chunked.value());
    }

    #[test]
    fn test_trailer_round_trip() {
        let mut c = TransferChecksum::new();
        c.update(b"hello");
        let trailer = c.trailer();

        let mut c2 = TransferChecksum::new();
        c2.update(b"hello");
        assert_eq!(parse_trailer(&trailer), c2.value());
    }

    #[test]
    fn test_empty_file_checksum() {
        // Zero-length files still carry a trailer
        assert_eq!(TransferChecksum::new().value(), 0);
    }
}
