//! Fixed-width pieces of the snapshot file. All integers are little-endian.
//!
//! ```text
//! [header: 32 bytes]
//! [bucket 0] .. [bucket BUCKETS_COUNT-1]
//! [crc32c of everything above: 4 bytes]
//! ```
//!
//! Bucket record:
//!
//! ```text
//! generation u64 | cursor_chunk u32 | cursor_offset u32
//! index_len u64  | index_len x (hash u64, locator u64)
//! touched u32    | touched x (chunk_index u32, CHUNK_SIZE bytes)
//! ```
use crate::arena::CHUNK_SIZE;
use crate::error::{Error, Result};

pub const MAGIC: [u8; 8] = *b"CHNKCACH";

pub const VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 32;

pub const CHECKSUM_SIZE: usize = 4;

/// Bytes of one `(hash, locator)` index pair.
pub const INDEX_PAIR_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,           // 8..12
    pub bucket_count: u32,      // 12..16
    pub chunk_size: u32,        // 16..20
    pub chunks_per_bucket: u32, // 20..24
    /// Declared total capacity, `bucket_count * chunks_per_bucket * chunk_size`.
    pub max_bytes: u64, // 24..32
}

impl Header {
    pub fn new(bucket_count: usize, chunks_per_bucket: usize) -> Self {
        Header {
            version: VERSION,
            bucket_count: bucket_count as u32,
            chunk_size: CHUNK_SIZE as u32,
            chunks_per_bucket: chunks_per_bucket as u32,
            max_bytes: (bucket_count * chunks_per_bucket * CHUNK_SIZE) as u64,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.bucket_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.chunks_per_bucket.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_bytes.to_le_bytes());
        buf
    }

    /// Parse the magic and version. Geometry is checked separately, after
    /// the checksum has been verified.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
            return Err(Error::Format("missing snapshot magic".into()));
        }
        if data.len() < HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "header truncated at {} bytes",
                data.len()
            )));
        }
        let u32_at =
            |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let version = u32_at(8);
        if version != VERSION {
            return Err(Error::Format(format!(
                "unsupported snapshot version {version}, expected {VERSION}"
            )));
        }
        let mut max_bytes = [0u8; 8];
        max_bytes.copy_from_slice(&data[24..32]);
        Ok(Header {
            version,
            bucket_count: u32_at(12),
            chunk_size: u32_at(16),
            chunks_per_bucket: u32_at(20),
            max_bytes: u64::from_le_bytes(max_bytes),
        })
    }
}

/// Split a ring position into `(chunk, offset)` with `offset <= CHUNK_SIZE`,
/// so a cursor sitting exactly at the end of the ring still names a real
/// chunk.
pub fn split_cursor(cursor: u64) -> (u32, u32) {
    let chunk_size = CHUNK_SIZE as u64;
    if cursor > 0 && cursor % chunk_size == 0 {
        ((cursor / chunk_size - 1) as u32, CHUNK_SIZE as u32)
    } else {
        ((cursor / chunk_size) as u32, (cursor % chunk_size) as u32)
    }
}

pub fn join_cursor(chunk: u32, offset: u32) -> u64 {
    chunk as u64 * CHUNK_SIZE as u64 + offset as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_geometry() {
        let header = Header::new(512, 3);
        let bytes = header.encode();
        assert_eq!(&bytes[..8], b"CHNKCACH");
        assert_eq!(Header::decode(&bytes).unwrap(), header);
        assert_eq!(header.max_bytes, 512 * 3 * CHUNK_SIZE as u64);
    }

    #[test]
    fn rejects_foreign_magic() {
        let mut bytes = Header::new(512, 1).encode();
        bytes[0] = b'X';
        assert!(matches!(Header::decode(&bytes), Err(Error::Format(_))));
        assert!(matches!(Header::decode(b"CHN"), Err(Error::Format(_))));
    }

    #[test]
    fn rejects_future_version() {
        let mut header = Header::new(512, 1);
        header.version = VERSION + 1;
        let err = Header::decode(&header.encode()).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err}");
    }

    #[test]
    fn truncated_header_is_corruption() {
        let bytes = Header::new(512, 1).encode();
        assert!(matches!(
            Header::decode(&bytes[..20]),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn cursor_at_chunk_boundary_stays_in_range() {
        let cs = CHUNK_SIZE as u64;
        assert_eq!(split_cursor(0), (0, 0));
        assert_eq!(split_cursor(10), (0, 10));
        assert_eq!(split_cursor(cs), (0, CHUNK_SIZE as u32));
        assert_eq!(split_cursor(2 * cs + 5), (2, 5));
        for cursor in [0, 10, cs, 2 * cs, 2 * cs + 5] {
            let (chunk, offset) = split_cursor(cursor);
            assert_eq!(join_cursor(chunk, offset), cursor);
        }
    }
}
