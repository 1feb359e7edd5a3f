//! Path translation between local absolute paths and wire paths
//!
//! Wire paths are relative to the replicated root and always use `/` as
//! separator. Every wire path received from the bus is validated before it
//! touches the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Resolve a wire path safely within the replicated root.
///
/// Rejects:
/// 1. Empty paths (the root itself is never replicated)
/// 2. Absolute paths
/// 3. Paths with `..` components
/// 4. Paths with null bytes or over-long components
///
/// Works on non-existent paths, symlinks are not followed.
pub fn resolve_wire_path(root: &Path, wire: &str) -> Result<PathBuf, ProtocolError> {
    if wire.contains('\0') {
        return Err(ProtocolError::PathTraversal("path contains null byte".into()));
    }

    if wire.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "path too long: {} bytes (max {})",
            wire.len(),
            MAX_PATH_LEN
        )));
    }

    let relative = Path::new(wire);
    if relative.is_absolute() {
        return Err(ProtocolError::PathTraversal(
            "absolute paths not allowed".into(),
        ));
    }

    let mut result = root.to_path_buf();
    let mut depth = 0usize;

    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                if name.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::PathTraversal(format!(
                        "filename too long: {} bytes (max {})",
                        name.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ProtocolError::PathTraversal(
                    "parent directory (..) not allowed".into(),
                ));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(ProtocolError::PathTraversal(
                    "path prefixes not allowed".into(),
                ));
            }
        }
    }

    if depth == 0 {
        return Err(ProtocolError::PathTraversal("empty path".into()));
    }

    Ok(result)
}

/// Reject `path` if any existing directory between `root` and it is a symlink.
///
/// The final component itself is not checked. Stops at the first ancestor
/// that does not exist yet. `path` must already be resolved under `root`.
pub fn check_no_symlink_ancestors(root: &Path, path: &Path) -> Result<(), ProtocolError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ProtocolError::OutsideRoot(path.display().to_string()))?;
    let Some(parent) = relative.parent() else {
        return Ok(());
    };

    let mut current = root.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ProtocolError::PathTraversal(format!(
                    "{} passes through symlink {}",
                    path.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    Ok(())
}

/// Convert a local absolute path into its wire form relative to `root`
pub fn to_wire_path(root: &Path, local: &Path) -> Result<String, ProtocolError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| ProtocolError::OutsideRoot(local.display().to_string()))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => match name.to_str() {
                Some(name) => parts.push(name),
                None => return Err(ProtocolError::NonUtf8(local.display().to_string())),
            },
            Component::CurDir => {}
            _ => return Err(ProtocolError::OutsideRoot(local.display().to_string())),
        }
    }

    if parts.is_empty() {
        return Err(ProtocolError::OutsideRoot(local.display().to_string()));
    }

    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/data")
    }

    #[test]
    fn test_resolve_normal() {
        assert_eq!(
            resolve_wire_path(&root(), "file.txt").unwrap(),
            PathBuf::from("/data/file.txt")
        );
        assert_eq!(
            resolve_wire_path(&root(), "a/b/c.txt").unwrap(),
            PathBuf::from("/data/a/b/c.txt")
        );
        assert_eq!(
            resolve_wire_path(&root(), "./dir/./file").unwrap(),
            PathBuf::from("/data/dir/file")
        );
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        assert!(resolve_wire_path(&root(), "../etc/passwd").is_err());
        assert!(resolve_wire_path(&root(), "a/../../etc").is_err());
        assert!(resolve_wire_path(&root(), "/etc/passwd").is_err());
        assert!(resolve_wire_path(&root(), "file\0.txt").is_err());
    }

    #[test]
    fn test_resolve_rejects_root_itself() {
        assert!(resolve_wire_path(&root(), "").is_err());
        assert!(resolve_wire_path(&root(), ".").is_err());
    }

    #[test]
    fn test_length_limits() {
        let long_name = "a".repeat(MAX_FILENAME_LEN + 1);
        assert!(resolve_wire_path(&root(), &long_name).is_err());

        let long_path = format!("dir/{}", "a".repeat(MAX_PATH_LEN));
        assert!(resolve_wire_path(&root(), &long_path).is_err());
    }

    #[test]
    fn test_to_wire_path() {
        assert_eq!(
            to_wire_path(&root(), Path::new("/data/d1/x")).unwrap(),
            "d1/x"
        );
        assert!(matches!(
            to_wire_path(&root(), Path::new("/etc/passwd")),
            Err(ProtocolError::OutsideRoot(_))
        ));
        assert!(to_wire_path(&root(), Path::new("/data")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_to_wire_path_rejects_non_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let local = root().join(OsStr::from_bytes(b"bad\xffname"));
        assert!(matches!(
            to_wire_path(&root(), &local),
            Err(ProtocolError::NonUtf8(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_ancestor_rejected() {
        let root = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let through = root.path().join("link/deeper/file");
        assert!(matches!(
            check_no_symlink_ancestors(root.path(), &through),
            Err(ProtocolError::PathTraversal(_))
        ));

        // The link itself and plain or missing directories are fine
        assert!(check_no_symlink_ancestors(root.path(), &root.path().join("link")).is_ok());
        assert!(check_no_symlink_ancestors(root.path(), &root.path().join("real/f")).is_ok());
        assert!(check_no_symlink_ancestors(root.path(), &root.path().join("new/a/b")).is_ok());
    }

    #[test]
    fn test_wire_path_roundtrip_between_roots() {
        let wire = to_wire_path(Path::new("/srv/a"), Path::new("/srv/a/docs/x.md")).unwrap();
        let local = resolve_wire_path(Path::new("/home/b/replica"), &wire).unwrap();
        assert_eq!(local, PathBuf::from("/home/b/replica/docs/x.md"));
    }
}
