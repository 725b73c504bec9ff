//! Byte layout of one entry inside a chunk:
//! `[key_len: u16 BE][value_len: u16 BE][key bytes][value bytes]`.
use crate::arena::CHUNK_SIZE;

pub const ENTRY_HEADER_SIZE: usize = 4;

pub const MAX_KEY_LEN: usize = u16::MAX as usize;

pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// Total encoded length, or `None` if the entry cannot be stored.
#[inline]
pub fn encoded_len(key: &[u8], value: &[u8]) -> Option<usize> {
    if key.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
        return None;
    }
    let len = ENTRY_HEADER_SIZE + key.len() + value.len();
    (len <= CHUNK_SIZE).then_some(len)
}

/// Write an entry at the start of `dst`. `dst` must hold `encoded_len` bytes.
#[inline]
pub fn write(dst: &mut [u8], key: &[u8], value: &[u8]) {
    dst[0..2].copy_from_slice(&(key.len() as u16).to_be_bytes());
    dst[2..4].copy_from_slice(&(value.len() as u16).to_be_bytes());
    let key_end = ENTRY_HEADER_SIZE + key.len();
    dst[ENTRY_HEADER_SIZE..key_end].copy_from_slice(key);
    dst[key_end..key_end + value.len()].copy_from_slice(value);
}

/// Borrowed view of an entry read back from a chunk.
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Decode the entry starting at `offset`. Returns `None` if the header or
/// the lengths it declares run past the end of the chunk, which only
/// happens with corrupted state.
#[inline]
pub fn read(chunk: &[u8], offset: usize) -> Option<EntryRef<'_>> {
    let header = chunk.get(offset..offset.checked_add(ENTRY_HEADER_SIZE)?)?;
    let key_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let value_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let key_start = offset + ENTRY_HEADER_SIZE;
    let value_start = key_start + key_len;
    let value = chunk.get(value_start..value_start + value_len)?;
    Some(EntryRef {
        key: &chunk[key_start..value_start],
        value,
    })
}
