//! Filesystem seam between the samplers and `/proc` / `/sys`.
//!
//! Production code reads through [`RealFs`]; tests populate a
//! [`MockFs`](crate::collector::MockFs) with fixture files.

use std::io;
use std::path::{Path, PathBuf};

/// Read-only view of the pseudo filesystems the samplers consume.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory as full paths.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_real_fs_reads_files_and_dirs() {
        let dir = tempdir().unwrap();
        let uptime = dir.path().join("uptime");
        std::fs::write(&uptime, "123.45 678.90\n").unwrap();
        std::fs::create_dir(dir.path().join("42")).unwrap();

        let fs = RealFs::new();
        assert_eq!(fs.read_to_string(&uptime).unwrap(), "123.45 678.90\n");
        assert!(fs.exists(&uptime));
        assert!(!fs.exists(&dir.path().join("missing")));

        let mut entries = fs.read_dir(dir.path()).unwrap();
        entries.sort();
        assert_eq!(entries, vec![dir.path().join("42"), uptime]);
    }
}
