//! Host filesystem access used by the directory cache.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

/// One entry of a host directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Host directory enumeration.
///
/// The cache only needs listings; file data goes through `std::fs`
/// directly in the drives.
pub trait HostIo: Send + Sync {
    /// List a host directory, excluding `.` and `..`.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<HostDirEntry>>;
}

/// `HostIo` backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHostIo;

impl HostIo for StdHostIo {
    fn read_dir(&self, path: &Path) -> io::Result<Vec<HostDirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!(name = ?raw, "skipping host name that is not valid UTF-8");
                    continue;
                }
            };
            // Follow symlinks so linked directories can be entered
            let is_dir = fs::metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false);
            entries.push(HostDirEntry { name, is_dir });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_host_read_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let mut entries = StdHostIo.read_dir(dir.path()).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![
                HostDirEntry { name: "a.txt".into(), is_dir: false },
                HostDirEntry { name: "sub".into(), is_dir: true },
            ]
        );
    }

    #[test]
    fn test_std_host_read_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StdHostIo.read_dir(&dir.path().join("nope")).is_err());
    }
}
