//! Packed `(generation, ring position)` stored as the value of a bucket index.
//!
//! Layout: `[generation: 24 bits][position: 40 bits]`. The position is the
//! byte offset inside the bucket's chunk ring, so `position / CHUNK_SIZE`
//! is the chunk index and `position % CHUNK_SIZE` the offset inside it.
use crate::arena::CHUNK_SIZE;

/// Bits reserved for the ring position. Caps a bucket at 1 TiB.
pub const POSITION_BITS: u32 = 40;

pub const GENERATION_BITS: u32 = 64 - POSITION_BITS;

/// Largest generation value a locator can hold. Generation 0 is never
/// issued, so a zeroed locator is never live.
pub const MAX_GENERATION: u64 = (1 << GENERATION_BITS) - 1;

/// Largest ring a bucket may own.
pub const MAX_POSITION: u64 = 1 << POSITION_BITS;

const POSITION_MASK: u64 = MAX_POSITION - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Locator(u64);

impl Locator {
    #[inline]
    pub fn new(generation: u64, position: u64) -> Self {
        debug_assert!(position < MAX_POSITION);
        Locator(((generation & MAX_GENERATION) << POSITION_BITS) | (position & POSITION_MASK))
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Locator(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn generation(self) -> u64 {
        self.0 >> POSITION_BITS
    }

    #[inline]
    pub fn position(self) -> u64 {
        self.0 & POSITION_MASK
    }

    #[inline]
    pub fn chunk_index(self) -> usize {
        (self.position() / CHUNK_SIZE as u64) as usize
    }

    #[inline]
    pub fn chunk_offset(self) -> usize {
        (self.position() % CHUNK_SIZE as u64) as usize
    }

    /// Whether the bytes this locator points at are still intact given the
    /// bucket's current generation and write cursor.
    ///
    /// Live entries are those written in the current generation behind the
    /// cursor, or in the previous generation at or ahead of it. Everything
    /// else has been overwritten by the ring. Recency is approximate: the
    /// window is two generations wide, not an LRU order.
    #[inline]
    pub fn is_live(self, bucket_generation: u64, cursor: u64) -> bool {
        let current = bucket_generation & MAX_GENERATION;
        let gen = self.generation();
        let pos = self.position();
        (gen == current && pos < cursor) || (pos >= cursor && gen == previous_generation(current))
    }
}

/// Advance a monotonic bucket generation, skipping values whose low bits
/// are zero.
#[inline]
pub fn next_generation(generation: u64) -> u64 {
    let next = generation.wrapping_add(1);
    if next & MAX_GENERATION == 0 {
        next.wrapping_add(1)
    } else {
        next
    }
}

#[inline]
fn previous_generation(current: u64) -> u64 {
    if current <= 1 {
        MAX_GENERATION
    } else {
        current - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_position_into_chunk_and_offset() {
        let loc = Locator::new(7, 3 * CHUNK_SIZE as u64 + 100);
        assert_eq!(loc.generation(), 7);
        assert_eq!(loc.chunk_index(), 3);
        assert_eq!(loc.chunk_offset(), 100);
        assert_eq!(Locator::from_raw(loc.raw()), loc);
    }

    #[test]
    fn live_in_current_generation_behind_cursor() {
        let loc = Locator::new(5, 10);
        assert!(loc.is_live(5, 11));
        assert!(!loc.is_live(5, 10));
    }

    #[test]
    fn live_in_previous_generation_ahead_of_cursor() {
        let loc = Locator::new(4, 1000);
        assert!(loc.is_live(5, 1000));
        assert!(loc.is_live(5, 0));
        // The cursor has passed it in the new generation.
        assert!(!loc.is_live(5, 1001));
    }

    #[test]
    fn stale_after_two_generations() {
        let loc = Locator::new(3, 1000);
        assert!(!loc.is_live(5, 0));
        assert!(!loc.is_live(5, 2000));
    }

    #[test]
    fn window_survives_generation_wrap() {
        let loc = Locator::new(MAX_GENERATION, 500);
        // MAX_GENERATION is followed by 1 (0 is skipped).
        let wrapped = next_generation(MAX_GENERATION);
        assert_eq!(wrapped & MAX_GENERATION, 1);
        assert!(loc.is_live(wrapped, 100));
        assert!(!loc.is_live(next_generation(wrapped), 100));
    }

    #[test]
    fn zero_generation_never_issued() {
        let mut gen = 1u64;
        for _ in 0..(MAX_GENERATION + 5) {
            gen = next_generation(gen);
            assert_ne!(gen & MAX_GENERATION, 0);
        }
        assert!(!Locator::from_raw(0).is_live(1, 10));
    }
}
