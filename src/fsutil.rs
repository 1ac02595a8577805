//! Small filesystem helpers shared by the config store and session tracker

use nix::unistd::geteuid;
use std::fs::DirBuilder;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `contents` so that readers never observe a partial file.
///
/// The data goes to a temporary file in the destination directory, is synced,
/// and is then renamed over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_dir(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove a file. Returns `false` if it did not exist.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create `dir` and any missing parents with mode 0755.
pub fn create_dir(dir: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

/// Why `path` cannot be trusted to hold session state, if it can't.
///
/// It must not be a symlink, must belong to root or the effective user, and
/// must not be writable by group or others. A missing path is fine.
pub fn trust_problem(path: &Path) -> io::Result<Option<String>> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    if meta.file_type().is_symlink() {
        return Ok(Some("is a symlink".to_string()));
    }
    let owner = meta.uid();
    if owner != 0 && owner != geteuid().as_raw() {
        return Ok(Some(format!("is owned by uid {owner}")));
    }
    if meta.mode() & 0o022 != 0 {
        return Ok(Some(format!(
            "is writable by group or others (mode {:o})",
            meta.mode() & 0o7777
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("file.txt");

        write_atomic(&path, b"hello").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        fs::write(&path, "old contents that are longer").unwrap();

        write_atomic(&path, b"new").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        // No temp files left behind
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_create_dir_mode() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("state");

        create_dir(&dir).unwrap();

        let mode = fs::metadata(&dir).unwrap().mode() & 0o777;
        assert_eq!(mode & 0o022, 0);
        assert_eq!(trust_problem(&dir).unwrap(), None);
    }

    #[test]
    fn test_world_writable_dir_is_untrusted() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("state");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o777)).unwrap();

        let problem = trust_problem(&dir).unwrap().unwrap();
        assert!(problem.contains("writable by group or others"), "{problem}");
    }

    #[test]
    fn test_symlink_is_untrusted() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(trust_problem(&link).unwrap().as_deref(), Some("is a symlink"));
    }

    #[test]
    fn test_missing_path_is_trusted() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(trust_problem(&temp_dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_remove_if_exists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        fs::write(&path, "x").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
