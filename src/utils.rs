use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Check if current user has root privileges
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get the hostname of this system
pub fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string())
}

/// uid/gid of an existing path
#[cfg(unix)]
pub fn owner_of(path: &Path) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|m| (m.uid(), m.gid()))
}

#[cfg(not(unix))]
pub fn owner_of(_path: &Path) -> Option<(u32, u32)> {
    None
}

#[cfg(unix)]
pub fn chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

#[cfg(not(unix))]
pub fn chown(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Ok(())
}

/// chown a directory tree
pub fn chown_recursive(root: &Path, uid: u32, gid: u32) -> io::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        chown(entry.path(), uid, gid)?;
    }
    Ok(())
}

/// Copy the operator's upload into a generated unit's files directory with
/// 0644 permissions. Returns the destination path.
pub fn install_upload(source: &Path, files_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(files_dir)?;
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "upload has no file name"))?;
    let dest = files_dir.join(name);
    fs::copy(source, &dest)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o644))?;
    }
    debug!("Copied {} to {}", source.display(), dest.display());
    Ok(dest)
}

/// Look for a binary on PATH, then under each directory tree
pub fn find_binary(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    find_binary_under(name, dirs)
}

/// Look for a binary under each directory tree only, ignoring PATH
pub fn find_binary_under(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| WalkDir::new(dir).max_depth(4).into_iter().filter_map(|e| e.ok()))
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
}

/// Remove duplicates while keeping first-seen order
pub fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_install_upload_sets_permissions() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("beacon.sh");
        fs::write(&src, "#!/bin/sh\nid\n").unwrap();

        let dest = install_upload(&src, &dir.path().join("role").join("files")).unwrap();
        assert_eq!(dest, dir.path().join("role").join("files").join("beacon.sh"));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "#!/bin/sh\nid\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o644);
        }
    }

    #[test]
    fn test_find_binary_in_tree() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("opt").join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("mose-test-knife"), "").unwrap();

        let root = dir.path().to_path_buf();
        assert_eq!(find_binary("mose-test-knife", &[root.clone()]), Some(bin.join("mose-test-knife")));
        assert_eq!(find_binary("mose-test-missing", &[root]), None);
    }

    #[test]
    fn test_find_binary_under_ignores_path() {
        let dir = tempdir().unwrap();
        // sh is on PATH everywhere the tests run
        assert!(find_binary("sh", &[]).is_some());
        assert_eq!(find_binary_under("sh", &[dir.path().to_path_buf()]), None);
    }

    #[test]
    fn test_dedup_preserving_order() {
        let items = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedup_preserving_order(items), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_owner_of_existing_file() {
        let dir = tempdir().unwrap();
        #[cfg(unix)]
        assert!(owner_of(dir.path()).is_some());
        assert!(owner_of(&dir.path().join("missing")).is_none());
    }
}
