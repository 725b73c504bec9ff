//! Snapshot files on disk.
//!
//! Saves stream bucket records into a temporary file next to the target,
//! fsync it, and rename it into place, so readers only ever see a complete
//! snapshot. Loads memory-map the file and decode straight from the map.
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use memmap2::Mmap;
use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::codec::{self, ChecksumWriter};
use super::layout::Header;
use crate::cache::{Cache, BUCKETS_COUNT};
use crate::error::{Error, Result};

/// Directory the temporary file is created in: the target's own directory,
/// so the final rename never crosses filesystems.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

pub fn save(cache: &Cache, path: &Path, concurrency: usize) -> Result<()> {
    let started = Instant::now();
    let dir = parent_dir(path);
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    let tmp_path = tmp.path().to_path_buf();

    let written = write_snapshot(cache, tmp.as_file_mut(), concurrency)
        .map_err(|e| Error::io(&tmp_path, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(&tmp_path, e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;

    debug!(
        path = %path.display(),
        bytes = written,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "saved cache snapshot"
    );
    Ok(())
}

fn write_snapshot(cache: &Cache, file: &mut File, concurrency: usize) -> io::Result<u64> {
    let mut out = ChecksumWriter::new(BufWriter::new(file));
    out.write_all(&Header::new(BUCKETS_COUNT, cache.chunks_per_bucket()).encode())?;

    if concurrency <= 1 {
        let mut buf = Vec::new();
        for bucket in cache.buckets() {
            buf.clear();
            bucket.with_state(|state| {
                buf.reserve(codec::bucket_size_hint(&state));
                codec::encode_bucket(state, &mut buf);
            });
            out.write_all(&buf)?;
        }
    } else {
        write_parallel(cache, &mut out, concurrency.min(BUCKETS_COUNT))?;
    }

    let (mut inner, written) = out.finish()?;
    inner.flush()?;
    Ok(written)
}

/// Encode `concurrency` buckets at a time on a dedicated pool and write the
/// batch in bucket order. Only one batch of encoded buckets is held in
/// memory at once.
fn write_parallel<W: Write + Send>(
    cache: &Cache,
    out: &mut W,
    concurrency: usize,
) -> io::Result<()> {
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            warn!(%err, "snapshot thread pool unavailable, encoding on the global pool");
            return write_batches(cache, out, concurrency);
        }
    };
    pool.install(|| write_batches(cache, out, concurrency))
}

fn write_batches<W: Write>(cache: &Cache, out: &mut W, batch: usize) -> io::Result<()> {
    for group in cache.buckets().chunks(batch) {
        let encoded: Vec<Vec<u8>> = group
            .par_iter()
            .map(|bucket| {
                bucket.with_state(|state| {
                    let mut buf = Vec::with_capacity(codec::bucket_size_hint(&state));
                    codec::encode_bucket(state, &mut buf);
                    buf
                })
            })
            .collect();
        for buf in &encoded {
            out.write_all(buf)?;
        }
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<Cache> {
    let started = Instant::now();
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    if len == 0 {
        return Err(Error::Format(format!("{} is empty", path.display())));
    }

    // SAFETY: snapshots are only ever replaced by rename, never truncated
    // or rewritten in place, so the mapped bytes stay valid while we read.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
    let cache = codec::decode(&map)?;

    debug!(
        path = %path.display(),
        bytes = len,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "loaded cache snapshot"
    );
    Ok(cache)
}
