use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use crate::arena::CHUNK_SIZE;
use crate::bucket::Bucket;
use crate::error::{Error, Result};
use crate::key::hash_key;
use crate::locator::MAX_POSITION;
use crate::snapshot;
use crate::stats::Stats;

/// Number of independently locked shards.
pub const BUCKETS_COUNT: usize = 512;

/// Ring length at which bucket positions stop fitting in a locator.
pub const MAX_CHUNKS_PER_BUCKET: usize = (MAX_POSITION / CHUNK_SIZE as u64) as usize;

/// Chunks each bucket gets for a requested capacity: rounded down to whole
/// chunks, at least one, at most what a locator can address.
pub fn chunks_per_bucket(max_bytes: usize) -> usize {
    (max_bytes / BUCKETS_COUNT / CHUNK_SIZE).clamp(1, MAX_CHUNKS_PER_BUCKET)
}

/// Fixed-capacity byte cache for large numbers of small entries.
///
/// Keys are routed by hash to one of [`BUCKETS_COUNT`] buckets, each with
/// its own lock and chunk ring, so threads touching different buckets never
/// contend. Share it across threads with `Arc<Cache>`.
///
/// The cache is best-effort: entries vanish once the ring overwrites them,
/// when a later key collides on the same hash, and never because of a
/// failed call. Eviction order is approximate recency, not strict LRU.
pub struct Cache {
    buckets: Box<[Bucket]>,
    chunks_per_bucket: usize,
}

impl Cache {
    /// Create an empty cache holding at most `max_bytes`, rounded down to
    /// whole chunks per bucket. Requests too small to give every bucket one
    /// chunk are raised to that minimum; requests above
    /// `BUCKETS_COUNT * MAX_CHUNKS_PER_BUCKET * CHUNK_SIZE` (512 TiB) are
    /// capped there. Chunk memory is only allocated as it is written.
    pub fn new(max_bytes: usize) -> Self {
        let chunks = chunks_per_bucket(max_bytes);
        let rounded = BUCKETS_COUNT * chunks * CHUNK_SIZE;
        if rounded > max_bytes {
            warn!(
                requested = max_bytes,
                capacity = rounded,
                "cache capacity raised to one chunk per bucket"
            );
        } else if chunks == MAX_CHUNKS_PER_BUCKET {
            warn!(
                requested = max_bytes,
                capacity = rounded,
                "cache capacity capped at the largest addressable ring"
            );
        }
        let buckets = (0..BUCKETS_COUNT).map(|_| Bucket::new(chunks)).collect();
        Cache::from_buckets(buckets, chunks)
    }

    pub(crate) fn from_buckets(buckets: Vec<Bucket>, chunks_per_bucket: usize) -> Self {
        debug_assert_eq!(buckets.len(), BUCKETS_COUNT);
        debug_assert!(buckets.iter().all(|b| b.chunk_count() == chunks_per_bucket));
        Cache {
            buckets: buckets.into_boxed_slice(),
            chunks_per_bucket,
        }
    }

    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub(crate) fn chunks_per_bucket(&self) -> usize {
        self.chunks_per_bucket
    }

    /// Capacity in bytes after rounding.
    pub fn max_bytes(&self) -> usize {
        BUCKETS_COUNT * self.chunks_per_bucket * CHUNK_SIZE
    }

    #[inline(always)]
    fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[(hash % BUCKETS_COUNT as u64) as usize]
    }

    /// Store `value` under `key`.
    ///
    /// Entries whose key or value exceeds 65535 bytes, or that do not fit in
    /// one 64 KiB chunk together with the 4-byte entry header, are silently
    /// dropped and counted in [`Stats::oversize_skips`].
    pub fn set(&self, key: &[u8], value: &[u8]) {
        let hash = hash_key(key);
        self.bucket(hash).set(hash, key, value);
    }

    /// Append the value stored under `key` to `dst`.
    ///
    /// Returns `false` and leaves `dst` unchanged when the key is absent,
    /// which distinguishes a miss from a stored empty value.
    pub fn get(&self, dst: &mut Vec<u8>, key: &[u8]) -> bool {
        let hash = hash_key(key);
        self.bucket(hash).get(hash, key, dst)
    }

    /// Whether `key` is present, without copying its value.
    pub fn has(&self, key: &[u8]) -> bool {
        let hash = hash_key(key);
        self.bucket(hash).has(hash, key)
    }

    /// Remove `key` from the index. Its bytes are reclaimed only when the
    /// ring wraps over them.
    pub fn delete(&self, key: &[u8]) {
        let hash = hash_key(key);
        self.bucket(hash).delete(hash);
    }

    /// Drop every entry and release chunk memory. Capacity is unchanged.
    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.reset();
        }
    }

    /// Add this cache's counters to `s`. Call [`Stats::reset`] first when
    /// reusing `s`.
    pub fn update_stats(&self, s: &mut Stats) {
        for bucket in self.buckets.iter() {
            bucket.update_stats(s);
        }
    }

    pub fn stats(&self) -> Stats {
        let mut s = Stats::default();
        self.update_stats(&mut s);
        s
    }

    /// Atomically write a snapshot of the cache to `path`.
    ///
    /// Safe to call during concurrent reads, writes and other saves. Each
    /// bucket is captured under its own lock, so the file is consistent per
    /// bucket rather than across the whole cache.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        snapshot::save(self, path.as_ref(), 1)
    }

    /// Like [`Cache::save_to_file`], encoding up to `concurrency` buckets in
    /// parallel. Produces the same file format.
    pub fn save_to_file_concurrent(&self, path: impl AsRef<Path>, concurrency: usize) -> Result<()> {
        snapshot::save(self, path.as_ref(), concurrency)
    }

    /// Restore a cache saved with [`Cache::save_to_file`]. The capacity is
    /// the one recorded in the file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Cache> {
        snapshot::load(path.as_ref())
    }

    /// Restore from `path`, or return `Cache::new(max_bytes)` if the file is
    /// missing, unreadable, invalid, or was saved with a different capacity.
    /// A snapshot is never reshaped to fit another capacity.
    pub fn load_from_file_or_new(path: impl AsRef<Path>, max_bytes: usize) -> Cache {
        let path = path.as_ref();
        let expected = chunks_per_bucket(max_bytes);
        match Cache::load_from_file(path) {
            Ok(cache) if cache.chunks_per_bucket == expected => cache,
            Ok(cache) => {
                warn!(
                    path = %path.display(),
                    saved = cache.max_bytes(),
                    requested = BUCKETS_COUNT * expected * CHUNK_SIZE,
                    "snapshot capacity differs from requested, starting empty"
                );
                Cache::new(max_bytes)
            }
            Err(Error::Io { ref source, .. }) if source.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot found, starting empty");
                Cache::new(max_bytes)
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot restore snapshot, starting empty");
                Cache::new(max_bytes)
            }
        }
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("chunks_per_bucket", &self.chunks_per_bucket)
            .field("max_bytes", &self.max_bytes())
            .finish_non_exhaustive()
    }
}
