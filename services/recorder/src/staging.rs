//! On-disk staging of individual frames between arrival and cleanup.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Prefixes of files this service creates in the staging directory.
const OWNED_PREFIXES: [&str; 2] = ["frame_", "manifest_"];

/// Errors raised by the staging store.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Directory {path} is not usable: {source}")]
    Unusable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write frame {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Create `dir` if needed, resolve it to an absolute path and check that files
/// can be created in it.
pub fn ensure_dir(dir: &Path) -> Result<PathBuf, StagingError> {
    let unusable = |source| StagingError::Unusable {
        path: dir.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(unusable)?;
    let resolved = dir.canonicalize().map_err(unusable)?;

    let probe = resolved.join(format!(".probe-{}", std::process::id()));
    std::fs::write(&probe, b"").map_err(unusable)?;
    std::fs::remove_file(&probe).map_err(unusable)?;

    Ok(resolved)
}

/// Directory-backed store for incoming frame bytes.
#[derive(Debug)]
pub struct StagingStore {
    dir: PathBuf,
    extension: String,
    sequence: AtomicU64,
}

impl StagingStore {
    /// Open the store, creating the directory if it does not exist.
    pub fn open(dir: &Path, extension: &str) -> Result<Self, StagingError> {
        let dir = ensure_dir(dir)?;
        info!(staging_dir = %dir.display(), "Staging store ready");

        Ok(Self {
            dir,
            extension: extension.trim_start_matches('.').to_string(),
            sequence: AtomicU64::new(0),
        })
    }

    /// Absolute path of the staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build a unique path for a frame received at `received_at`.
    ///
    /// Names sort chronologically; the trailing sequence number separates
    /// frames that share a microsecond.
    pub fn frame_path(&self, received_at: DateTime<Utc>) -> PathBuf {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let name = format!(
            "frame_{}_{:06}.{}",
            received_at.format("%Y%m%d_%H%M%S_%6f"),
            seq,
            self.extension
        );
        self.dir.join(name)
    }

    /// Persist one frame and return where it was written.
    pub async fn write_frame(
        &self,
        bytes: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<PathBuf, StagingError> {
        let path = self.frame_path(received_at);
        if let Err(source) = tokio::fs::write(&path, bytes).await {
            // Nothing references a failed frame, so drop whatever was written.
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed partial frame"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial frame"),
            }
            return Err(StagingError::Write { path, source });
        }

        debug!(path = %path.display(), size = bytes.len(), "Frame staged");
        Ok(path)
    }

    /// Files this service created in the staging directory that are still
    /// present. Unrelated files are ignored.
    pub async fn leftovers(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(staging_dir = %self.dir.display(), error = %e, "Failed to list staging directory");
                return found;
            }
        };

        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if OWNED_PREFIXES.iter().any(|p| name.starts_with(p)) {
                        found.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read staging directory entry");
                    break;
                }
            }
        }

        found.sort();
        found
    }
}
