//! Filesystem provider for abstracting file operations.
//!
//! Identity bootstrap reads and writes key material through [`FileSystem`],
//! so tests can run it against a [`MemoryFs`] (including directories that
//! refuse writes) while production code uses [`RealFs`].

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

/// Provider trait for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Read file contents.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Write file contents, replacing any existing file.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Check if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Read a file, mapping "not found" to `None`.
    fn read_optional(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match self.read(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Real filesystem provider.
#[derive(Debug, Clone, Default)]
pub struct RealFs;

impl RealFs {
    /// Create a new real filesystem provider.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

/// In-memory filesystem for testing.
///
/// # Example
///
/// ```
/// use wko_core::providers::{FileSystem, MemoryFs};
/// use std::path::Path;
///
/// let fs = MemoryFs::new()
///     .with_file("/deployment/webhook-identity/webhookKey", b"key")
///     .with_read_only("/deployment/secrets");
///
/// assert!(fs.exists(Path::new("/deployment/webhook-identity/webhookKey")));
/// assert!(fs.write(Path::new("/deployment/secrets/x"), b"y").is_err());
/// ```
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    dirs: RwLock<BTreeSet<PathBuf>>,
    read_only: RwLock<Vec<PathBuf>>,
}

impl MemoryFs {
    /// Create an empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file (and its parent directories).
    pub fn with_file(self, path: impl AsRef<Path>, contents: &[u8]) -> Self {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.write().insert(path, contents.to_vec());
        self
    }

    /// Refuse writes and directory creation at or below `path`.
    pub fn with_read_only(self, path: impl AsRef<Path>) -> Self {
        self.read_only.write().push(path.as_ref().to_path_buf());
        self
    }

    /// Paths of every file currently stored.
    pub fn files(&self) -> Vec<PathBuf> {
        self.files.read().keys().cloned().collect()
    }

    fn add_parents(&self, path: &Path) {
        let mut dirs = self.dirs.write();
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            dirs.insert(ancestor.to_path_buf());
        }
    }

    fn check_writable(&self, path: &Path) -> io::Result<()> {
        if self.read_only.read().iter().any(|ro| path.starts_with(ro)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("read-only file system: {}", path.display()),
            ));
        }
        Ok(())
    }
}

impl FileSystem for MemoryFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files.read().get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.check_writable(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !self.dirs.read().contains(parent) {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such directory: {}", parent.display()),
                ));
            }
        }
        self.files
            .write()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path) || self.dirs.read().contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        if self.dirs.read().contains(path) {
            return Ok(());
        }
        self.check_writable(path)?;
        self.add_parents(path);
        self.dirs.write().insert(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_requires_parent_directory() {
        let fs = MemoryFs::new();
        let path = Path::new("/deployment/webhook-identity/webhookKey");
        assert_eq!(
            fs.write(path, b"k").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );

        fs.create_dir_all(Path::new("/deployment/webhook-identity"))
            .unwrap();
        fs.write(path, b"k").unwrap();
        assert_eq!(fs.read(path).unwrap(), b"k");
        assert!(fs.exists(Path::new("/deployment")));
    }

    #[test]
    fn read_only_prefix_denies_writes() {
        let fs = MemoryFs::new().with_read_only("/deployment");
        let err = fs
            .create_dir_all(Path::new("/deployment/webhook-identity"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn read_optional_maps_missing_to_none() {
        let fs = MemoryFs::new().with_file("/a/b", b"x");
        assert_eq!(fs.read_optional(Path::new("/a/b")).unwrap(), Some(b"x".to_vec()));
        assert_eq!(fs.read_optional(Path::new("/a/c")).unwrap(), None);
    }
}
