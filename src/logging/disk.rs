//! Free disk space probing.

use std::io;
use std::path::Path;

use sysinfo::Disks;

/// Source of free-space information for the filesystem holding a path.
pub trait DiskSpace: Send + Sync + 'static {
    /// Bytes available to unprivileged writers.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// Queries the mounted filesystems; the longest mount point containing the
/// path wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDiskSpace;

impl DiskSpace for FsDiskSpace {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted filesystem contains '{}'", path.display()),
                )
            })
    }
}

/// Always reports the same amount; used to simulate a nearly full disk.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub u64);

impl DiskSpace for FixedDiskSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_disk_space_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsDiskSpace
            .available_bytes(&dir.path().join("missing"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_fs_disk_space_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Minimal containers may expose no mount table; that is an error, not a panic.
        match FsDiskSpace.available_bytes(dir.path()) {
            Ok(_) => {}
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
        }
    }

    #[test]
    fn test_fixed_disk_space() {
        assert_eq!(FixedDiskSpace(42).available_bytes(Path::new("/")).unwrap(), 42);
    }
}
