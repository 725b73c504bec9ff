//! Whole-cache snapshots.
//!
//! Each bucket is locked only while its own record is encoded, so a save
//! runs alongside live traffic and other saves. The result is consistent
//! per bucket, not across the whole cache.
pub mod codec;
pub mod file;
pub mod layout;

pub use file::{load, save};
