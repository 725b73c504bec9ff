//! Encoding of bucket state into the snapshot format and decoding of a
//! whole snapshot back into a [`Cache`].
use std::io::{self, Write};

use ahash::RandomState;
use crc32c::{crc32c, crc32c_append};
use hashbrown::HashMap;

use super::layout::{
    join_cursor, split_cursor, Header, CHECKSUM_SIZE, HEADER_SIZE, INDEX_PAIR_SIZE,
};
use crate::arena::{ChunkRing, CHUNK_SIZE};
use crate::bucket::{Bucket, BucketState};
use crate::cache::{Cache, BUCKETS_COUNT, MAX_CHUNKS_PER_BUCKET};
use crate::error::{Error, Result};
use crate::locator::{Locator, MAX_GENERATION};

/// Writer that tracks a running crc32c of everything passed through it.
pub struct ChecksumWriter<W> {
    inner: W,
    crc: u32,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        ChecksumWriter {
            inner,
            crc: 0,
            written: 0,
        }
    }

    /// Append the checksum trailer and return the inner writer together
    /// with the total number of bytes written.
    pub fn finish(mut self) -> io::Result<(W, u64)> {
        let crc = self.crc;
        self.inner.write_all(&crc.to_le_bytes())?;
        Ok((self.inner, self.written + CHECKSUM_SIZE as u64))
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c_append(self.crc, &buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Append one bucket record to `out`. Stale index entries are left out.
pub fn encode_bucket(state: BucketState<'_>, out: &mut Vec<u8>) {
    let (cursor_chunk, cursor_offset) = split_cursor(state.cursor);
    out.extend_from_slice(&state.generation.to_le_bytes());
    out.extend_from_slice(&cursor_chunk.to_le_bytes());
    out.extend_from_slice(&cursor_offset.to_le_bytes());

    let len_at = out.len();
    out.extend_from_slice(&0u64.to_le_bytes());
    let mut live = 0u64;
    for (&hash, &raw) in state.index.iter() {
        if Locator::from_raw(raw).is_live(state.generation, state.cursor) {
            out.extend_from_slice(&hash.to_le_bytes());
            out.extend_from_slice(&raw.to_le_bytes());
            live += 1;
        }
    }
    out[len_at..len_at + 8].copy_from_slice(&live.to_le_bytes());

    let touched_at = out.len();
    out.extend_from_slice(&0u32.to_le_bytes());
    let mut touched = 0u32;
    for (index, chunk) in state.ring.touched() {
        out.extend_from_slice(&(index as u32).to_le_bytes());
        out.extend_from_slice(chunk);
        touched += 1;
    }
    out[touched_at..touched_at + 4].copy_from_slice(&touched.to_le_bytes());
}

pub fn bucket_size_hint(state: &BucketState<'_>) -> usize {
    24 + state.index.len() * INDEX_PAIR_SIZE
        + 4
        + state.ring.allocated_bytes()
        + (state.ring.allocated_bytes() / CHUNK_SIZE) * 4
}

/// Sequential reader over the snapshot payload. Every short read is
/// reported as corruption.
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Decoder { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Corruption(format!(
                "truncated {what} at offset {}",
                self.pos
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let b = self.take(8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Decode a full snapshot. The checksum is verified before any bucket is
/// reconstructed, and the result has exactly the serialized geometry.
pub fn decode(data: &[u8]) -> Result<Cache> {
    let header = Header::decode(data)?;
    if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(Error::Corruption("missing checksum trailer".into()));
    }

    let (body, trailer) = data.split_at(data.len() - CHECKSUM_SIZE);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32c(body);
    if stored != actual {
        return Err(Error::Corruption(format!(
            "checksum mismatch: stored {stored:08x}, computed {actual:08x}"
        )));
    }

    check_geometry(&header)?;
    let chunks_per_bucket = header.chunks_per_bucket as usize;

    let mut d = Decoder::new(&body[HEADER_SIZE..]);
    let mut buckets = Vec::with_capacity(BUCKETS_COUNT);
    for i in 0..BUCKETS_COUNT {
        buckets.push(decode_bucket(&mut d, chunks_per_bucket).map_err(|err| match err {
            Error::Corruption(reason) => Error::Corruption(format!("bucket {i}: {reason}")),
            other => other,
        })?);
    }
    if d.remaining() != 0 {
        return Err(Error::Corruption(format!(
            "{} trailing bytes after last bucket",
            d.remaining()
        )));
    }

    Ok(Cache::from_buckets(buckets, chunks_per_bucket))
}

fn check_geometry(header: &Header) -> Result<()> {
    if header.bucket_count as usize != BUCKETS_COUNT {
        return Err(Error::Format(format!(
            "snapshot has {} buckets, this build uses {BUCKETS_COUNT}",
            header.bucket_count
        )));
    }
    if header.chunk_size as usize != CHUNK_SIZE {
        return Err(Error::Format(format!(
            "snapshot chunk size is {}, this build uses {CHUNK_SIZE}",
            header.chunk_size
        )));
    }
    let chunks = header.chunks_per_bucket as usize;
    if chunks == 0 || chunks > MAX_CHUNKS_PER_BUCKET {
        return Err(Error::Corruption(format!(
            "invalid chunks per bucket {chunks}"
        )));
    }
    let declared = (BUCKETS_COUNT * chunks * CHUNK_SIZE) as u64;
    if header.max_bytes != declared {
        return Err(Error::Corruption(format!(
            "declared capacity {} does not match geometry ({declared})",
            header.max_bytes
        )));
    }
    Ok(())
}

fn decode_bucket(d: &mut Decoder<'_>, chunks_per_bucket: usize) -> Result<Bucket> {
    let generation = d.u64("generation")?;
    if generation & MAX_GENERATION == 0 {
        return Err(Error::Corruption(format!("invalid generation {generation}")));
    }

    let cursor_chunk = d.u32("cursor")?;
    let cursor_offset = d.u32("cursor")?;
    if cursor_chunk as usize >= chunks_per_bucket || cursor_offset as usize > CHUNK_SIZE {
        return Err(Error::Corruption(format!(
            "cursor ({cursor_chunk}, {cursor_offset}) outside the ring"
        )));
    }
    let cursor = join_cursor(cursor_chunk, cursor_offset);

    let index_len = d.u64("index length")?;
    if index_len > (d.remaining() / INDEX_PAIR_SIZE) as u64 {
        return Err(Error::Corruption(format!(
            "index length {index_len} exceeds remaining payload"
        )));
    }
    let mut index = HashMap::with_capacity_and_hasher(index_len as usize, RandomState::new());
    for _ in 0..index_len {
        let hash = d.u64("index entry")?;
        let raw = d.u64("index entry")?;
        index.insert(hash, raw);
    }

    let touched = d.u32("chunk count")? as usize;
    if touched > chunks_per_bucket {
        return Err(Error::Corruption(format!(
            "{touched} chunks stored for a ring of {chunks_per_bucket}"
        )));
    }
    let mut ring = ChunkRing::new(chunks_per_bucket);
    let mut previous: Option<usize> = None;
    for _ in 0..touched {
        let chunk_index = d.u32("chunk index")? as usize;
        if chunk_index >= chunks_per_bucket || previous.is_some_and(|p| chunk_index <= p) {
            return Err(Error::Corruption(format!(
                "chunk index {chunk_index} out of order or range"
            )));
        }
        previous = Some(chunk_index);
        let bytes = d.take(CHUNK_SIZE, "chunk")?;
        ring.install(chunk_index, bytes.into());
    }

    // Live entries must point into a chunk that was stored with them.
    for &raw in index.values() {
        let loc = Locator::from_raw(raw);
        let chunk = loc.chunk_index();
        if chunk >= chunks_per_bucket {
            return Err(Error::Corruption(format!(
                "locator {raw:#x} names chunk {chunk} of a ring of {chunks_per_bucket}"
            )));
        }
        if loc.is_live(generation, cursor) && ring.get(chunk).is_none() {
            return Err(Error::Corruption(format!(
                "locator {raw:#x} points into unstored chunk {chunk}"
            )));
        }
    }

    Ok(Bucket::restore(ring, index, cursor, generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::hash_key;
    use crate::stats::Stats;

    fn encode(cache: &Cache) -> Vec<u8> {
        let mut out = ChecksumWriter::new(Vec::new());
        out.write_all(&Header::new(BUCKETS_COUNT, cache.chunks_per_bucket()).encode())
            .unwrap();
        let mut buf = Vec::new();
        for bucket in cache.buckets() {
            buf.clear();
            bucket.with_state(|state| encode_bucket(state, &mut buf));
            out.write_all(&buf).unwrap();
        }
        let (bytes, written) = out.finish().unwrap();
        assert_eq!(written as usize, bytes.len());
        bytes
    }

    fn sample_cache() -> Cache {
        let cache = Cache::new(BUCKETS_COUNT * CHUNK_SIZE);
        for i in 0..100 {
            cache.set(format!("k{i}").as_bytes(), format!("v{i}").as_bytes());
        }
        cache
    }

    #[test]
    fn decodes_what_was_encoded() {
        let cache = sample_cache();
        let restored = decode(&encode(&cache)).unwrap();
        assert_eq!(restored.stats().entries_count, 100);
        let mut dst = Vec::new();
        assert!(restored.get(&mut dst, b"k42"));
        assert_eq!(dst, b"v42");
    }

    #[test]
    fn untouched_chunks_are_omitted() {
        let cache = Cache::new(BUCKETS_COUNT * CHUNK_SIZE * 4);
        cache.set(b"only", b"one");
        let bytes = encode(&cache);
        // One chunk in total plus fixed per-bucket overhead.
        let per_bucket = 8 + 4 + 4 + 8 + 4;
        let expected = HEADER_SIZE
            + BUCKETS_COUNT * per_bucket
            + INDEX_PAIR_SIZE
            + 4
            + CHUNK_SIZE
            + CHECKSUM_SIZE;
        assert_eq!(bytes.len(), expected);

        let restored = decode(&bytes).unwrap();
        assert_eq!(restored.stats().bytes_size, CHUNK_SIZE as u64);
        assert!(restored.has(b"only"));
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut bytes = encode(&sample_cache());
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("checksum")), "{err}");
    }

    #[test]
    fn truncated_file_is_rejected() {
        let bytes = encode(&sample_cache());
        assert!(matches!(
            decode(&bytes[..bytes.len() - 100]),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(decode(&bytes[..HEADER_SIZE]), Err(Error::Corruption(_))));
        assert!(matches!(decode(&[]), Err(Error::Format(_))));
    }

    /// Re-seal a modified payload with a valid checksum.
    fn reseal(mut bytes: Vec<u8>) -> Vec<u8> {
        bytes.truncate(bytes.len() - CHECKSUM_SIZE);
        let crc = crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn foreign_geometry_is_format_error() {
        let mut bytes = encode(&sample_cache());
        bytes[16..20].copy_from_slice(&(CHUNK_SIZE as u32 * 2).to_le_bytes());
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err}");

        let mut bytes = encode(&sample_cache());
        bytes[12..16].copy_from_slice(&256u32.to_le_bytes());
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err}");
    }

    #[test]
    fn inconsistent_capacity_is_corruption() {
        let mut bytes = encode(&sample_cache());
        bytes[24..32].copy_from_slice(&1u64.to_le_bytes());
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)), "{err}");
    }

    #[test]
    fn cursor_outside_ring_is_corruption() {
        let mut bytes = encode(&sample_cache());
        // First bucket record: generation (8) then cursor chunk.
        let at = HEADER_SIZE + 8;
        bytes[at..at + 4].copy_from_slice(&7u32.to_le_bytes());
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("bucket 0")), "{err}");
    }

    /// Offset of the first locator in bucket 0, which must hold at least one
    /// index entry.
    fn first_locator_at(bytes: &[u8]) -> usize {
        let len_at = HEADER_SIZE + 16;
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[len_at..len_at + 8]);
        assert!(u64::from_le_bytes(len) > 0, "bucket 0 has no entries");
        len_at + 8 + 8
    }

    fn dense_cache(max_bytes: usize) -> Cache {
        let cache = Cache::new(max_bytes);
        for i in 0..5_000 {
            cache.set(format!("k{i}").as_bytes(), b"v");
        }
        cache
    }

    #[test]
    fn locator_past_the_ring_is_corruption() {
        let mut bytes = encode(&dense_cache(BUCKETS_COUNT * CHUNK_SIZE));
        let at = first_locator_at(&bytes);
        let bad = Locator::new(1, 5 * CHUNK_SIZE as u64).raw();
        bytes[at..at + 8].copy_from_slice(&bad.to_le_bytes());
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("chunk 5")), "{err}");
    }

    #[test]
    fn live_locator_into_unstored_chunk_is_corruption() {
        // Four chunks per bucket, only chunk 0 written.
        let mut bytes = encode(&dense_cache(BUCKETS_COUNT * CHUNK_SIZE * 4));
        let at = first_locator_at(&bytes);
        // Previous generation ahead of the cursor still counts as live.
        let bad = Locator::new(MAX_GENERATION, 2 * CHUNK_SIZE as u64).raw();
        bytes[at..at + 8].copy_from_slice(&bad.to_le_bytes());
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("unstored")), "{err}");
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut bytes = encode(&sample_cache());
        let at = bytes.len() - CHECKSUM_SIZE;
        bytes.splice(at..at, [0u8; 3]);
        let err = decode(&reseal(bytes)).unwrap_err();
        assert!(matches!(err, Error::Corruption(ref m) if m.contains("trailing")), "{err}");
    }

    #[test]
    fn stale_entries_are_not_persisted() {
        let cache = Cache::new(BUCKETS_COUNT * CHUNK_SIZE);
        // About 600 entries fit a chunk; push several rings' worth through
        // every bucket.
        for i in 0..1_000_000u32 {
            cache.set(&i.to_le_bytes(), &[0u8; 100]);
        }
        let before = cache.stats().entries_count;
        let restored = decode(&encode(&cache)).unwrap();
        let after = restored.stats().entries_count;
        assert!(after <= before);
        assert!(after > 0);
        let last = 999_999u32.to_le_bytes();
        assert!(restored.has(&last));
        let mut s = restored.stats();
        assert_eq!(s.misses, 0);
        // Lookups on restored entries never hit a stale locator.
        let first_bucket = (hash_key(&last) % BUCKETS_COUNT as u64) as usize;
        restored.buckets()[first_bucket].with_state(|state| {
            for &raw in state.index.values() {
                assert!(Locator::from_raw(raw).is_live(state.generation, state.cursor));
            }
        });
        s.reset();
        assert_eq!(s, Stats::default());
    }
}
