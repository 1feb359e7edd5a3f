//! Core type definitions for mfs
//!
//! These types describe local filesystem changes as observed by the watch
//! source, before they are turned into wire messages.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Mask selecting permission bits (including setuid/setgid/sticky) from a raw mode
pub const PERMISSION_MASK: u32 = 0o7777;

/// Kind of change observed on a path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Write,
    Remove,
    Move,
    Chmod,
}

/// Type of filesystem entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
}

/// Metadata snapshot of a path (lstat semantics, symlinks are not followed)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub kind: FileKind,
    /// Permission bits only, file type bits are stripped
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl FileMeta {
    /// Build a snapshot from `std::fs::Metadata` obtained via `symlink_metadata`
    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            kind: kind_of(meta),
            mode: meta.mode() & PERMISSION_MASK,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
        Self {
            kind: kind_of(meta),
            mode,
            uid: 0,
            gid: 0,
            size: meta.len(),
        }
    }

    /// Stat a path without following symlinks
    pub fn lstat(path: &Path) -> std::io::Result<Self> {
        fs::symlink_metadata(path).map(|m| Self::from_metadata(&m))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

fn kind_of(meta: &fs::Metadata) -> FileKind {
    let ft = meta.file_type();
    if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_dir() {
        FileKind::Directory
    } else {
        FileKind::File
    }
}

/// A single filesystem notification, as handed to the coalescer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Absolute path the change applies to (destination for moves)
    pub path: PathBuf,
    pub op: Operation,
    /// Move source, only set for `Operation::Move`
    pub old_path: Option<PathBuf>,
    /// Metadata at observation time, `None` if the path was already gone
    pub meta: Option<FileMeta>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, op: Operation) -> Self {
        Self {
            path: path.into(),
            op,
            old_path: None,
            meta: None,
        }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            path: to.into(),
            op: Operation::Move,
            old_path: Some(from.into()),
            meta: None,
        }
    }

    /// Attach a metadata snapshot of `path`, if it still exists
    pub fn observed(mut self) -> Self {
        self.meta = FileMeta::lstat(&self.path).ok();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lstat_kinds() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"abc").unwrap();

        let meta = FileMeta::lstat(dir.path()).unwrap();
        assert!(meta.is_dir());

        let meta = FileMeta::lstat(&file).unwrap();
        assert!(meta.is_file());
        assert_eq!(meta.size, 3);
        assert_eq!(meta.mode & !PERMISSION_MASK, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_lstat_does_not_follow_symlinks() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let meta = FileMeta::lstat(&link).unwrap();
        assert!(meta.is_symlink());
        assert!(!meta.is_dir());
    }

    #[test]
    fn test_observed_missing_path() {
        let event = ChangeEvent::new("/nonexistent/mfs/file", Operation::Remove).observed();
        assert!(event.meta.is_none());
        assert_eq!(event.op, Operation::Remove);
    }

    #[test]
    fn test_moved_event() {
        let event = ChangeEvent::moved("/data/a", "/data/b");
        assert_eq!(event.op, Operation::Move);
        assert_eq!(event.path, PathBuf::from("/data/b"));
        assert_eq!(event.old_path, Some(PathBuf::from("/data/a")));
    }
}
