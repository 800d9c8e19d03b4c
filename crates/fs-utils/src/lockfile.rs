use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as _;

use crate::Result;

/// An advisory exclusive lock on a single-instance resource.
///
/// Held for the lifetime of the daemon process over the metadata device's
/// companion `.lock` file, so a second daemon instance refuses to start
/// against a device that is already served.
#[derive(Clone)]
pub struct LockFile {
    path: Arc<PathBuf>,
    #[allow(dead_code)]
    file: Arc<File>,
}

impl LockFile {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(file),
        })
    }
}

impl fmt::Debug for LockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFile").field("path", &self.path).finish()
    }
}
