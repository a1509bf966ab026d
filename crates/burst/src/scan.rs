//! Scanner module for discovering burst files in the input directory.
//!
//! Only the top level of the input directory is considered. Plain files ending
//! in `.fits` are processed; files ending in `.fits.Z` are decompressed first.

use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Suffix of uncompressed burst files.
pub const FITS_SUFFIX: &str = ".fits";

/// Suffix of Unix-compressed burst files.
pub const COMPRESSED_SUFFIX: &str = ".fits.Z";

/// Errors raised while listing the input directory.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Input directory {0} does not exist or is not a directory")]
    NotADirectory(PathBuf),

    #[error("Failed to list {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.len() > suffix.len() && n.ends_with(suffix))
        .unwrap_or(false)
}

/// Checks if a path names an uncompressed burst file.
pub fn is_fits_file(path: &Path) -> bool {
    has_suffix(path, FITS_SUFFIX)
}

/// Checks if a path names a compressed burst file.
pub fn is_compressed_fits(path: &Path) -> bool {
    has_suffix(path, COMPRESSED_SUFFIX)
}

/// Lists the top-level files of `dir` accepted by `filter`, sorted by file name.
fn list_files(dir: &Path, filter: fn(&Path) -> bool) -> Result<Vec<PathBuf>, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|source| ScanError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file() && filter(entry.path()) {
            files.push(entry.into_path());
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Burst files to process, in lexicographic file-name order.
///
/// The sort order defines file sequence positions used for nod inference.
pub fn scan_fits_files(dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
    list_files(dir, is_fits_file)
}

/// Compressed burst files awaiting decompression.
pub fn scan_compressed_files(dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
    list_files(dir, is_compressed_fits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    #[test]
    fn test_suffix_matching() {
        assert!(is_fits_file(Path::new("/data/VISIR_0001.fits")));
        assert!(!is_fits_file(Path::new("/data/VISIR_0001.fits.Z")));
        assert!(!is_fits_file(Path::new("/data/VISIR_0001.FITS")));
        assert!(!is_fits_file(Path::new("/data/.fits")));
        assert!(is_compressed_fits(Path::new("/data/VISIR_0001.fits.Z")));
        assert!(!is_compressed_fits(Path::new("/data/VISIR_0001.fits")));
    }

    #[test]
    fn test_scan_sorted_and_top_level_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for name in ["c.fits", "a.fits", "b.fits.Z", "notes.txt", "B.fits"] {
            File::create(root.join(name)).unwrap();
        }
        fs::create_dir(root.join("nested")).unwrap();
        File::create(root.join("nested/d.fits")).unwrap();
        fs::create_dir(root.join("dir.fits")).unwrap();

        let files = scan_fits_files(root).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["B.fits", "a.fits", "c.fits"]);

        let compressed = scan_compressed_files(root).unwrap();
        assert_eq!(compressed, vec![root.join("b.fits.Z")]);
    }

    #[test]
    fn test_scan_missing_dir() {
        let result = scan_fits_files(Path::new("/nonexistent/input"));
        assert!(matches!(result, Err(ScanError::NotADirectory(_))));
    }

    // Property: the scan result is always sorted by file name and contains
    // exactly the created `.fits` files.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_scan_sorted(names in prop::collection::hash_set("[a-z0-9_]{1,12}", 0..12)) {
            let temp_dir = TempDir::new().unwrap();
            for name in &names {
                File::create(temp_dir.path().join(format!("{}.fits", name))).unwrap();
            }

            let files = scan_fits_files(temp_dir.path()).unwrap();
            prop_assert_eq!(files.len(), names.len());
            prop_assert!(files.windows(2).all(|w| w[0].file_name() < w[1].file_name()));
        }
    }
}
