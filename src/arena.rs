//! Fixed-size chunk ring owned by a single bucket.

/// Size of one chunk. An entry never spans two chunks.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Slots are created only as far as the write cursor has reached, so the
/// cost of an untouched ring does not depend on its length.
pub struct ChunkRing {
    chunks: Vec<Option<Box<[u8]>>>,
    len: usize,
}

impl ChunkRing {
    pub fn new(len: usize) -> Self {
        ChunkRing {
            chunks: Vec::new(),
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.chunks.get(index).and_then(|c| c.as_deref())
    }

    /// Borrow a chunk mutably, allocating it on first use.
    ///
    /// Panics if `index` is outside the ring; the bucket only ever asks for
    /// indices below `len()`.
    pub fn get_or_alloc(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.len, "chunk {index} outside ring of {}", self.len);
        if index >= self.chunks.len() {
            self.chunks.resize_with(index + 1, || None);
        }
        self.chunks[index].get_or_insert_with(|| vec![0u8; CHUNK_SIZE].into_boxed_slice())
    }

    pub fn install(&mut self, index: usize, bytes: Box<[u8]>) {
        debug_assert_eq!(bytes.len(), CHUNK_SIZE);
        assert!(index < self.len, "chunk {index} outside ring of {}", self.len);
        if index >= self.chunks.len() {
            self.chunks.resize_with(index + 1, || None);
        }
        self.chunks[index] = Some(bytes);
    }

    /// Chunks that have been written to, in index order.
    pub fn touched(&self) -> impl Iterator<Item = (usize, &[u8])> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_deref().map(|bytes| (i, bytes)))
    }

    pub fn allocated_bytes(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count() * CHUNK_SIZE
    }

    /// Drop every chunk buffer and the slot table. Capacity is unchanged.
    pub fn release(&mut self) {
        self.chunks = Vec::new();
    }
}
