//! Typed paths for a running `chunksnapd` instance.
//!
//! Block devices are passed in directly by the operator (they are not
//! owned by the daemon the way a data directory is), but the daemon's own
//! run-state — control socket, advisory lock, config file — lives under a
//! single directory whose conventional layout is captured here as types
//! instead of ad hoc `PathBuf::join` calls scattered through the daemon.

use std::fmt;
use std::path::{Path, PathBuf};

macro_rules! typed_path {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub PathBuf);

        impl std::ops::Deref for $name {
            type Target = Path;
            fn deref(&self) -> &Path {
                &self.0
            }
        }

        impl AsRef<Path> for $name {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.display())
            }
        }

        impl From<PathBuf> for $name {
            fn from(p: PathBuf) -> Self {
                Self(p)
            }
        }
    };
}

typed_path!(
    /// The directory holding a single daemon instance's run-state.
    StoreDir
);
typed_path!(
    /// A regular file or block special file backing the metadata device.
    MetadataDevicePath
);
typed_path!(
    /// A regular file or block special file backing the snapshot-data
    /// device. May equal [`MetadataDevicePath`].
    SnapshotDataDevicePath
);
typed_path!(
    /// A regular file or block special file backing the origin volume.
    OriginDevicePath
);
typed_path!(
    /// Unix-domain control socket the kernel client and administrative
    /// tools connect to.
    ControlSocketPath
);

impl StoreDir {
    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.0)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.0.join("chunksnapd.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.0.join("chunksnapd.toml")
    }

    pub fn default_socket(&self) -> ControlSocketPath {
        ControlSocketPath(self.0.join("control.sock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_dir_derives_conventional_children() {
        let dir = StoreDir(PathBuf::from("/var/lib/chunksnapd"));
        assert_eq!(dir.lock_file(), PathBuf::from("/var/lib/chunksnapd/chunksnapd.lock"));
        assert_eq!(
            dir.default_socket().0,
            PathBuf::from("/var/lib/chunksnapd/control.sock")
        );
    }
}
