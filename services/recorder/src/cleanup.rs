//! Best-effort deletion of staged files.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of a cleanup pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files deleted by this pass
    pub removed: usize,
    /// Files that were already gone
    pub missing: usize,
    /// Files that could not be deleted
    pub failed: usize,
}

/// Delete every path in `paths`.
///
/// Duplicates are removed once. A missing file counts as `missing`; any other
/// error is logged and counted as `failed`. Never returns an error.
pub async fn remove_files<I, P>(paths: I) -> CleanupReport
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut report = CleanupReport::default();

    for path in paths {
        let path = path.as_ref();
        if !seen.insert(path.to_path_buf()) {
            continue;
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                report.removed += 1;
                debug!(path = %path.display(), "Deleted staged file");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.missing += 1;
            }
            Err(e) => {
                report.failed += 1;
                warn!(path = %path.display(), error = %e, "Failed to delete staged file");
            }
        }
    }

    info!(
        removed = report.removed,
        missing = report.missing,
        failed = report.failed,
        "Cleanup finished"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_removes_existing_files() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        let b = tmp.path().join("b.jpg");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let report = remove_files([&a, &b]).await;
        assert_eq!(report.removed, 2);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_missing_file_does_not_stop_remaining_deletions() {
        let tmp = TempDir::new().unwrap();
        let gone = tmp.path().join("gone.jpg");
        let present = tmp.path().join("present.jpg");
        std::fs::write(&present, b"x").unwrap();

        let report = remove_files(vec![gone, present.clone()]).await;
        assert_eq!(
            report,
            CleanupReport {
                removed: 1,
                missing: 1,
                failed: 0
            }
        );
        assert!(!present.exists());
    }

    #[tokio::test]
    async fn test_duplicates_are_deleted_once() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        std::fs::write(&a, b"a").unwrap();

        let report = remove_files(vec![a.clone(), a.clone(), a.clone()]).await;
        assert_eq!(report.removed, 1);
        assert_eq!(report.missing, 0);
    }

    #[tokio::test]
    async fn test_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.jpg");
        std::fs::write(&a, b"a").unwrap();

        remove_files([&a]).await;
        let second = remove_files([&a]).await;
        assert_eq!(second.removed, 0);
        assert_eq!(second.missing, 1);
    }

    #[tokio::test]
    async fn test_directory_counts_as_failure() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("subdir");
        std::fs::create_dir(&dir).unwrap();
        let file = tmp.path().join("f.jpg");
        std::fs::write(&file, b"f").unwrap();

        let report = remove_files([&dir, &file]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 1);
        assert!(dir.exists());
    }
}
