/// Counters summed across all buckets by [`crate::Cache::update_stats`].
///
/// Buckets are visited one at a time, so under concurrent writes the
/// totals are an approximation rather than a point-in-time snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of `get` and `has` calls.
    pub get_calls: u64,
    /// Number of `set` calls, including the ones dropped as oversized.
    pub set_calls: u64,
    pub misses: u64,
    /// Lookups whose index slot held a different key. Should stay close to
    /// zero; a high value points at a poor hash.
    pub collisions: u64,
    /// Locators or entry headers found pointing outside a bucket's arena.
    pub corruptions: u64,
    /// Entries dropped because they cannot fit in a single chunk.
    pub oversize_skips: u64,
    /// Index entries currently held, stale ones not yet purged included.
    pub entries_count: u64,
    /// Bytes held by allocated chunks.
    pub bytes_size: u64,
    /// Capacity in bytes after rounding to whole chunks.
    pub max_bytes_size: u64,
}

impl Stats {
    /// Zero every counter so the struct can be reused with `update_stats`.
    pub fn reset(&mut self) {
        *self = Stats::default();
    }
}
