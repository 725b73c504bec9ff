use xxhash_rust::xxh3::xxh3_64;

/// Hash used both to route a key to its bucket and as the key of the
/// bucket's index.
///
/// The value is persisted in snapshots, so it must stay stable across
/// processes and builds. xxh3 is seedless and platform independent.
#[inline(always)]
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_calls() {
        assert_eq!(hash_key(b"key 1"), hash_key(b"key 1"));
        assert_ne!(hash_key(b"key 1"), hash_key(b"key 2"));
    }

    #[test]
    fn empty_key_hashes() {
        // Empty keys are legal cache keys.
        let _ = hash_key(b"");
    }
}
