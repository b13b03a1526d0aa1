//! Read-only filesystem inspection used by the prober.

use std::io;
use std::path::{Path, PathBuf};

/// What a path currently points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File { len: u64 },
    Dir,
}

/// Side-effect-free view of the filesystem and the host `PATH`.
pub trait PathInspector: Send + Sync {
    fn kind(&self, path: &Path) -> PathKind;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Whether new entries can be created in `dir`.
    fn is_writable(&self, dir: &Path) -> bool;

    /// Resolve an executable on `PATH`.
    fn find_program(&self, name: &str) -> Option<PathBuf>;

    fn is_dir(&self, path: &Path) -> bool {
        self.kind(path) == PathKind::Dir
    }

    fn exists(&self, path: &Path) -> bool {
        self.kind(path) != PathKind::Missing
    }
}

/// The local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl PathInspector for LocalFs {
    fn kind(&self, path: &Path) -> PathKind {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => PathKind::Dir,
            Ok(meta) => PathKind::File { len: meta.len() },
            Err(_) => PathKind::Missing,
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    // access(2) against the effective user; nothing is created to test it.
    #[cfg(unix)]
    fn is_writable(&self, dir: &Path) -> bool {
        use nix::unistd::{access, AccessFlags};
        self.is_dir(dir) && access(dir, AccessFlags::W_OK | AccessFlags::X_OK).is_ok()
    }

    #[cfg(not(unix))]
    fn is_writable(&self, dir: &Path) -> bool {
        std::fs::metadata(dir)
            .map(|meta| meta.is_dir() && !meta.permissions().readonly())
            .unwrap_or(false)
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}
