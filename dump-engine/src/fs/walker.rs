//! Work-directory traversal for packing.
//!
//! Produces the flat list of files that go into an archive, with names
//! relative to the work directory root and `/` separators regardless of
//! platform.

use crate::Result;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// A file to be written into the archive
#[derive(Debug, Clone)]
pub struct PackEntry {
    /// Full path on disk
    pub path: PathBuf,

    /// Entry name inside the archive, relative to the walked root
    pub archive_name: String,

    /// File size in bytes
    pub size: u64,
}

impl PackEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative = path.strip_prefix(root).unwrap_or(&path);

        Ok(Self {
            archive_name: archive_name(relative),
            size: metadata.len(),
            path,
        })
    }
}

/// Zip entries always use `/`
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a directory tree and collect all regular files, sorted by archive name
/// so archives are laid out deterministically.
pub fn collect_entries(root: &Path) -> Result<Vec<PackEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        entries.push(PackEntry::from_entry(&entry, root)?);
    }

    entries.sort_by(|a, b| a.archive_name.cmp(&b.archive_name));
    Ok(entries)
}

/// Count regular files under `root` without collecting them
pub fn count_files(root: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        if entry?.file_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}
