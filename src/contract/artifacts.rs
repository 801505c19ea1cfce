//! Download directory inspection
//!
//! Snapshots record every regular file under a directory with its size so a
//! check can tell what a single tool call created.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Files under a directory and their sizes at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSnapshot {
    files: BTreeMap<PathBuf, u64>,
}

impl ArtifactSnapshot {
    /// Walk `dir` recursively; a missing directory is an empty snapshot
    pub fn capture(dir: &Path) -> io::Result<Self> {
        let mut files = BTreeMap::new();
        if dir.exists() {
            collect(dir, &mut files)?;
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn size_of(&self, path: &Path) -> Option<u64> {
        self.files.get(path).copied()
    }

    pub fn files(&self) -> impl Iterator<Item = (&Path, u64)> {
        self.files.iter().map(|(path, size)| (path.as_path(), *size))
    }

    /// Files of size zero, which are always a defect
    pub fn zero_byte_files(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|(_, size)| **size == 0)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Files that are new, or whose size changed, relative to `before`
    pub fn changed_since(&self, before: &ArtifactSnapshot) -> Vec<(PathBuf, u64)> {
        self.files
            .iter()
            .filter(|(path, size)| before.files.get(*path) != Some(*size))
            .map(|(path, size)| (path.clone(), *size))
            .collect()
    }
}

fn collect(dir: &Path, files: &mut BTreeMap<PathBuf, u64>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect(&entry.path(), files)?;
        } else if file_type.is_file() {
            files.insert(entry.path(), entry.metadata()?.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let snapshot = ArtifactSnapshot::capture(&dir.path().join("absent")).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_capture_recurses_and_records_sizes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.pdf"), b"%PDF-1.4").unwrap();
        fs::create_dir(dir.path().join("cs.AI")).unwrap();
        fs::write(dir.path().join("cs.AI").join("b.pdf"), b"").unwrap();

        let snapshot = ArtifactSnapshot::capture(dir.path()).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.size_of(&dir.path().join("a.pdf")), Some(8));
        assert_eq!(
            snapshot.zero_byte_files(),
            vec![dir.path().join("cs.AI").join("b.pdf")]
        );
    }

    #[test]
    fn test_changed_since() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.pdf"), b"old").unwrap();
        fs::write(dir.path().join("grown.pdf"), b"x").unwrap();
        let before = ArtifactSnapshot::capture(dir.path()).unwrap();

        fs::write(dir.path().join("grown.pdf"), b"xxxx").unwrap();
        fs::write(dir.path().join("new.pdf"), b"new!").unwrap();
        let after = ArtifactSnapshot::capture(dir.path()).unwrap();

        let changed = after.changed_since(&before);
        let names: Vec<_> = changed
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["grown.pdf", "new.pdf"]);
        assert!(before.changed_since(&before).is_empty());
    }
}
