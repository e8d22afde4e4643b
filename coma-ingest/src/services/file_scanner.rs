//! Staging tree scanner
//!
//! Recursive discovery of exposure files by suffix. Symlinks are not
//! followed. Pipeline-owned directories (scratch, archive, dead-letter)
//! nested inside the staging root are skipped so that work in progress is
//! never rediscovered.

use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Staging tree scanner
pub struct FileScanner {
    suffix: String,
    excluded_dirs: Vec<PathBuf>,
    ignore_prefixes: Vec<String>,
}

impl FileScanner {
    /// Scanner matching file names ending in `suffix`
    ///
    /// Hidden files (leading `.`) are ignored; transfer tools use them for
    /// partial uploads.
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            excluded_dirs: Vec::new(),
            ignore_prefixes: vec![".".to_string()],
        }
    }

    /// Skip the given directories (and everything below them)
    pub fn excluding<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.excluded_dirs = dirs
            .into_iter()
            .map(|d| normalize(d.as_ref()))
            .collect();
        self
    }

    /// Sorted list of matching files under `root_path`
    pub fn scan(&self, root_path: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !root_path.exists() {
            return Err(ScanError::PathNotFound(root_path.to_path_buf()));
        }

        if !root_path.is_dir() {
            return Err(ScanError::NotADirectory(root_path.to_path_buf()));
        }

        let walker = WalkDir::new(root_path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || self.should_process_entry(e));

        let mut files = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && self.matches_suffix(entry.path()) {
                        files.push(entry.path().to_path_buf());
                    }
                }
                Err(e) => {
                    // Keep scanning; one unreadable directory must not hide the rest
                    tracing::warn!("Error accessing entry: {}", e);
                }
            }
        }

        files.sort();
        tracing::debug!(
            root = %root_path.display(),
            files = files.len(),
            "Staging scan complete"
        );

        Ok(files)
    }

    fn should_process_entry(&self, entry: &DirEntry) -> bool {
        let file_name = entry.file_name().to_string_lossy();
        if self.ignore_prefixes.iter().any(|p| file_name.starts_with(p.as_str())) {
            return false;
        }

        if entry.file_type().is_dir() {
            let path = normalize(entry.path());
            if self.excluded_dirs.iter().any(|excluded| *excluded == path) {
                tracing::debug!(dir = %entry.path().display(), "Skipping pipeline directory");
                return false;
            }
        }

        true
    }

    fn matches_suffix(&self, path: &Path) -> bool {
        path.file_name()
            .map(|n| n.to_string_lossy().ends_with(self.suffix.as_str()))
            .unwrap_or(false)
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"SIMPLE  =").unwrap();
    }

    #[test]
    fn test_scan_nonexistent_path() {
        let scanner = FileScanner::new(".fz");
        match scanner.scan(Path::new("/nonexistent/path")) {
            Err(ScanError::PathNotFound(_)) => {}
            other => panic!("Expected PathNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_file_as_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.fz");
        touch(&file);

        let scanner = FileScanner::new(".fz");
        assert!(matches!(scanner.scan(&file), Err(ScanError::NotADirectory(_))));
    }

    #[test]
    fn test_scan_matches_suffix_recursively_and_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("night2/b.fz"));
        touch(&root.join("night1/a.fz"));
        touch(&root.join("night1/notes.txt"));
        touch(&root.join("night1/a.fits"));
        touch(&root.join(".partial.fz"));

        let files = FileScanner::new(".fz").scan(root).unwrap();

        assert_eq!(files, vec![root.join("night1/a.fz"), root.join("night2/b.fz")]);
    }

    #[test]
    fn test_scan_skips_pipeline_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("new/a.fz"));
        touch(&root.join("scratch/a.fz"));
        touch(&root.join("dead_letter/old.fz"));

        let files = FileScanner::new(".fz")
            .excluding([root.join("scratch"), root.join("dead_letter")])
            .scan(root)
            .unwrap();

        assert_eq!(files, vec![root.join("new/a.fz")]);
    }

    #[test]
    fn test_scan_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(FileScanner::new(".fz").scan(temp_dir.path()).unwrap().is_empty());
    }
}
