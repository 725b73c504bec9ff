use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the snapshot layer.
///
/// The hot path (`set`, `get`, `has`, `delete`) never fails; oversized
/// entries and hash collisions are counted in [`crate::Stats`] instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Missing or unknown magic, unsupported version, or geometry this
    /// build cannot represent.
    #[error("unrecognized snapshot format: {0}")]
    Format(String),

    /// Checksum mismatch or a structurally inconsistent dump.
    #[error("corrupted snapshot: {0}")]
    Corruption(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
