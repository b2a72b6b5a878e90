//! Per-job scratch directories.

use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// A uniquely named directory that receives one job's dumped content.
///
/// Dropping a `WorkDir` does not delete it: packing consumes the directory
/// and failure handling decides explicitly when to call [`WorkDir::clear`].
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Allocate `<parent>/<random id>` and create it
    pub async fn create(parent: &Path) -> io::Result<Self> {
        let path = parent.join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&path).await?;
        debug!("Allocated work dir {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `collections/<name>` inside the work dir
    pub fn collection_dir(&self, name: &str) -> PathBuf {
        self.path.join("collections").join(name)
    }

    /// Recursively remove the directory. Absent or half-written directories are fine.
    pub async fn clear(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!("Removed work dir {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
