/// Count and size of files the tool created in the writable layer of its container
use crate::types::TerminationReason;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Files synthesized for the container that do not count against the tool
pub const SYNTHESIZED_FILES: [&str; 5] = [
    "etc/passwd",
    "etc/group",
    "etc/hostname",
    "etc/hosts",
    "etc/nsswitch.conf",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HierarchyUsage {
    pub count: u64,
    pub size: u64,
}

/// Limits on the writable layer below `root`
#[derive(Clone, Debug, PartialEq)]
pub struct FileHierarchyLimit {
    pub root: PathBuf,
    pub max_count: Option<u64>,
    pub max_size: Option<u64>,
}

impl FileHierarchyLimit {
    /// Scan the layer and report which limit, if any, is exceeded
    pub fn check(&self) -> Option<TerminationReason> {
        let usage = match scan(&self.root) {
            Ok(usage) => usage,
            Err(e) => {
                log::debug!("Could not scan {}: {}", self.root.display(), e);
                return None;
            }
        };
        log::debug!(
            "Writable layer has {} files with {} bytes",
            usage.count,
            usage.size
        );
        if self.max_count.is_some_and(|max| usage.count > max) {
            Some(TerminationReason::FilesCount)
        } else if self.max_size.is_some_and(|max| usage.size > max) {
            Some(TerminationReason::FilesSize)
        } else {
            None
        }
    }
}

/// Regular files below `root`, symlinks not followed
pub fn scan(root: &Path) -> io::Result<HierarchyUsage> {
    let mut usage = HierarchyUsage::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // the tool may delete directories while we look at them
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir != root => continue,
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let path = entry.path();
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() && !is_synthesized(root, &path) {
                usage.count += 1;
                usage.size += metadata.len();
            }
        }
    }
    Ok(usage)
}

pub fn is_synthesized(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|relative| SYNTHESIZED_FILES.iter().any(|file| relative == Path::new(file)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_counts_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), b"12345").unwrap();
        fs::write(dir.path().join("a/b/two"), b"123").unwrap();
        std::os::unix::fs::symlink(dir.path().join("a/one"), dir.path().join("link")).unwrap();

        let usage = scan(dir.path()).unwrap();
        assert_eq!(usage, HierarchyUsage { count: 2, size: 8 });
    }

    #[test]
    fn test_synthesized_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/passwd"), b"root:x:0:0").unwrap();
        fs::write(dir.path().join("etc/other"), b"x").unwrap();
        assert_eq!(scan(dir.path()).unwrap().count, 1);
    }

    #[test]
    fn test_limit_reasons() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            fs::write(dir.path().join(format!("f{}", i)), vec![0u8; 100]).unwrap();
        }
        let mut limit = FileHierarchyLimit {
            root: dir.path().to_path_buf(),
            max_count: Some(2),
            max_size: Some(10),
        };
        assert_eq!(limit.check(), Some(TerminationReason::FilesCount));
        limit.max_count = Some(10);
        assert_eq!(limit.check(), Some(TerminationReason::FilesSize));
        limit.max_size = Some(1000);
        assert_eq!(limit.check(), None);
    }
}
