//! Fixed-capacity in-process cache for large numbers of small byte entries.
//!
//! ```no_run
//! use chunkcache::Cache;
//!
//! let cache = Cache::load_from_file_or_new("/var/tmp/cache.bin", 32 << 20);
//! cache.set(b"key", b"value");
//!
//! let mut buf = Vec::new();
//! if cache.get(&mut buf, b"key") {
//!     assert_eq!(buf, b"value");
//! }
//! cache.save_to_file("/var/tmp/cache.bin")?;
//! # Ok::<(), chunkcache::Error>(())
//! ```
mod arena;
mod bucket;
mod cache;
mod entry;
mod error;
mod key;
mod locator;
mod snapshot;
mod stats;

pub use arena::CHUNK_SIZE;
pub use cache::{Cache, BUCKETS_COUNT};
pub use entry::{MAX_KEY_LEN, MAX_VALUE_LEN};
pub use error::{Error, Result};
pub use key::hash_key;
pub use stats::Stats;
