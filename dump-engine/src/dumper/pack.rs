//! Zip packing of a finished work directory.
//!
//! Blocking code: run it under `spawn_blocking`.

use crate::fs::walker::collect_entries;
use crate::utils::Result;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const MAX_DEFLATE_LEVEL: i64 = 9;

/// Write every file under `root` into a new archive at `dest`, named
/// relative to `root`. `entries_done` is bumped after each entry.
///
/// Returns the archive size in bytes. A partially written `dest` is left
/// behind on error; the caller owns its cleanup.
pub fn pack_dir(root: &Path, dest: &Path, entries_done: &AtomicUsize) -> Result<u64> {
    let entries = collect_entries(root)?;
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(MAX_DEFLATE_LEVEL))
        .large_file(true);

    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    for entry in &entries {
        zip.start_file(entry.archive_name.as_str(), options)?;
        let mut reader = BufReader::new(File::open(&entry.path)?);
        io::copy(&mut reader, &mut zip)?;
        entries_done.fetch_add(1, Ordering::Relaxed);
        debug!("Packed {} ({} bytes)", entry.archive_name, entry.size);
    }

    let mut out = zip.finish()?;
    io::Write::flush(&mut out)?;
    drop(out);

    Ok(std::fs::metadata(dest)?.len())
}
