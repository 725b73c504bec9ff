//! One shard of the cache: a chunk ring, a hash index into it, and the
//! lock that guards both.
//!
//! Entries are appended at the write cursor. When an entry does not fit in
//! the rest of the current chunk the cursor jumps to the start of the next
//! one; past the last chunk it wraps to chunk 0 and the generation advances.
//! Old entries are never freed individually: they stop being readable once
//! their locator falls out of the two-generation window.
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::arena::{ChunkRing, CHUNK_SIZE};
use crate::entry;
use crate::locator::{next_generation, Locator};
use crate::stats::Stats;

/// Maps a key hash to the raw [`Locator`] of its latest entry.
pub type Index = HashMap<u64, u64, RandomState>;

/// Generation of a fresh bucket. 0 is reserved so zeroed locators are dead.
pub const INITIAL_GENERATION: u64 = 1;

pub fn new_index() -> Index {
    HashMap::with_hasher(RandomState::new())
}

struct BucketInner {
    ring: ChunkRing,
    index: Index,
    /// Ring position of the next write.
    cursor: u64,
    generation: u64,
}

enum Probe<'a> {
    Hit(&'a [u8]),
    Absent,
    Stale(Locator),
    Collision,
    Corrupt,
}

impl BucketInner {
    fn probe(&self, hash: u64, key: &[u8]) -> Probe<'_> {
        let Some(&raw) = self.index.get(&hash) else {
            return Probe::Absent;
        };
        let loc = Locator::from_raw(raw);
        if !loc.is_live(self.generation, self.cursor) {
            return Probe::Stale(loc);
        }
        let Some(chunk) = self.ring.get(loc.chunk_index()) else {
            return Probe::Corrupt;
        };
        match entry::read(chunk, loc.chunk_offset()) {
            Some(e) if e.key == key => Probe::Hit(e.value),
            Some(_) => Probe::Collision,
            None => Probe::Corrupt,
        }
    }

    fn append(&mut self, hash: u64, key: &[u8], value: &[u8], len: usize) {
        let mut chunk_index = (self.cursor / CHUNK_SIZE as u64) as usize;
        let mut offset = (self.cursor % CHUNK_SIZE as u64) as usize;
        let mut wrapped = false;

        if chunk_index >= self.ring.len() || offset + len > CHUNK_SIZE {
            // The tail of the current chunk is abandoned.
            if offset > 0 {
                chunk_index += 1;
            }
            if chunk_index >= self.ring.len() {
                chunk_index = 0;
                self.generation = next_generation(self.generation);
                wrapped = true;
            }
            offset = 0;
        }

        let chunk = self.ring.get_or_alloc(chunk_index);
        entry::write(&mut chunk[offset..offset + len], key, value);

        let position = (chunk_index * CHUNK_SIZE + offset) as u64;
        self.index
            .insert(hash, Locator::new(self.generation, position).raw());
        self.cursor = position + len as u64;

        if wrapped {
            self.purge_stale();
        }
    }

    /// Drop every index entry whose bytes the ring has overwritten.
    fn purge_stale(&mut self) {
        let (generation, cursor) = (self.generation, self.cursor);
        self.index
            .retain(|_, raw| Locator::from_raw(*raw).is_live(generation, cursor));
    }
}

#[derive(Default)]
struct Counters {
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    misses: AtomicU64,
    collisions: AtomicU64,
    corruptions: AtomicU64,
    oversize_skips: AtomicU64,
}

impl Counters {
    fn clear(&self) {
        for c in [
            &self.get_calls,
            &self.set_calls,
            &self.misses,
            &self.collisions,
            &self.corruptions,
            &self.oversize_skips,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Read-only view of a bucket handed out while its lock is held.
pub struct BucketState<'a> {
    pub generation: u64,
    pub cursor: u64,
    pub index: &'a Index,
    pub ring: &'a ChunkRing,
}

pub struct Bucket {
    inner: RwLock<BucketInner>,
    counters: Counters,
}

impl Bucket {
    pub fn new(chunk_count: usize) -> Self {
        Self::restore(
            ChunkRing::new(chunk_count),
            new_index(),
            0,
            INITIAL_GENERATION,
        )
    }

    pub fn restore(ring: ChunkRing, index: Index, cursor: u64, generation: u64) -> Self {
        Bucket {
            inner: RwLock::new(BucketInner {
                ring,
                index,
                cursor,
                generation,
            }),
            counters: Counters::default(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.read().ring.len()
    }

    /// Append `(key, value)`. Entries that cannot fit in one chunk are
    /// dropped and counted in `oversize_skips`.
    pub fn set(&self, hash: u64, key: &[u8], value: &[u8]) {
        self.counters.set_calls.fetch_add(1, Ordering::Relaxed);
        let Some(len) = entry::encoded_len(key, value) else {
            self.counters.oversize_skips.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.inner.write().append(hash, key, value, len);
    }

    /// Append the value for `key` to `dst`. Returns `false` on a miss and
    /// leaves `dst` untouched.
    pub fn get(&self, hash: u64, key: &[u8], dst: &mut Vec<u8>) -> bool {
        self.read_with(hash, key, |value| dst.extend_from_slice(value))
    }

    pub fn has(&self, hash: u64, key: &[u8]) -> bool {
        self.read_with(hash, key, |_| {})
    }

    /// Probe under the read lock and hand the value to `on_hit` before the
    /// lock is released, so a concurrent writer cannot tear the copy.
    fn read_with(&self, hash: u64, key: &[u8], on_hit: impl FnOnce(&[u8])) -> bool {
        self.counters.get_calls.fetch_add(1, Ordering::Relaxed);

        let stale = {
            let inner = self.inner.read();
            match inner.probe(hash, key) {
                Probe::Hit(value) => {
                    on_hit(value);
                    return true;
                }
                Probe::Stale(loc) => Some(loc),
                Probe::Collision => {
                    self.counters.collisions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Probe::Corrupt => {
                    self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Probe::Absent => None,
            }
        };
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(loc) = stale {
            let mut inner = self.inner.write();
            // Another writer may have replaced the mapping in between.
            if inner.index.get(&hash) == Some(&loc.raw()) {
                inner.index.remove(&hash);
            }
        }
        false
    }

    pub fn delete(&self, hash: u64) {
        self.inner.write().index.remove(&hash);
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.ring.release();
        inner.index = new_index();
        inner.cursor = 0;
        inner.generation = INITIAL_GENERATION;
        self.counters.clear();
    }

    pub fn update_stats(&self, s: &mut Stats) {
        let c = &self.counters;
        s.get_calls += c.get_calls.load(Ordering::Relaxed);
        s.set_calls += c.set_calls.load(Ordering::Relaxed);
        s.misses += c.misses.load(Ordering::Relaxed);
        s.collisions += c.collisions.load(Ordering::Relaxed);
        s.corruptions += c.corruptions.load(Ordering::Relaxed);
        s.oversize_skips += c.oversize_skips.load(Ordering::Relaxed);

        let inner = self.inner.read();
        s.entries_count += inner.index.len() as u64;
        s.bytes_size += inner.ring.allocated_bytes() as u64;
        s.max_bytes_size += (inner.ring.len() * CHUNK_SIZE) as u64;
    }

    /// Run `f` against the bucket state under the read lock. Writers to this
    /// bucket wait until `f` returns; other buckets are unaffected.
    pub fn with_state<R>(&self, f: impl FnOnce(BucketState<'_>) -> R) -> R {
        let inner = self.inner.read();
        f(BucketState {
            generation: inner.generation,
            cursor: inner.cursor,
            index: &inner.index,
            ring: &inner.ring,
        })
    }
}
