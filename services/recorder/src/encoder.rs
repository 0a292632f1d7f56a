//! External encoder invocation.
//!
//! The final frame sequence is written to an ffmpeg concat-demuxer manifest
//! and handed to the encoder process. The process runs under a wall-clock
//! timeout and a cancellation token; on either it is killed and reaped before
//! the call returns. The video is produced under a hidden pending name and only
//! renamed into place once the encoder exits successfully, so the output
//! directory never exposes partial files.

use crate::cleanup;
use crate::config::EncoderConfig;
use async_trait::async_trait;
use chrono::Utc;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

/// Errors that prevent the encoder from running at all.
#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("Failed to write manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder binary not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn encoder {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for encoder: {0}")]
    Wait(#[source] std::io::Error),
}

/// One encode request.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    /// Final frame sequence, one entry per output frame
    pub frames: Vec<PathBuf>,

    /// Output frame rate
    pub fps: u32,
}

/// How an encode attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// The video is in place at `output`
    Success { output: PathBuf, elapsed: Duration },

    /// The encoder exited unsuccessfully
    Failed { code: Option<i32>, stderr: String },

    /// The encoder could not be started
    LaunchFailed { reason: String },

    /// The encoder exceeded its time limit and was killed
    TimedOut { after: Duration },

    /// Shutdown interrupted the encode and the process was killed
    Cancelled,
}

impl EncodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EncodeOutcome::Success { .. })
    }
}

/// Seam between the assembler and the encoding backend.
#[async_trait]
pub trait FrameEncoder: Send + Sync {
    async fn encode(&self, job: EncodeJob, cancel: &CancellationToken) -> EncodeOutcome;
}

/// Encoder command-line settings.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub binary: String,
    pub codec: String,
    pub preset: String,
    pub bitrate: String,
    pub resolution: Option<String>,
    pub pixel_format: String,
    pub container_extension: String,
    pub timeout: Duration,
}

impl From<&EncoderConfig> for EncoderSettings {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            codec: config.codec.clone(),
            preset: config.preset.clone(),
            bitrate: config.bitrate.clone(),
            resolution: config.resolution.clone(),
            pixel_format: config.pixel_format.clone(),
            container_extension: config.container_extension.trim_start_matches('.').to_string(),
            timeout: config.timeout(),
        }
    }
}

enum Waited<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Runs an ffmpeg-compatible binary over a concat manifest.
pub struct FfmpegEncoder {
    settings: EncoderSettings,
    manifest_dir: PathBuf,
    output_dir: PathBuf,
    sequence: AtomicU64,
}

impl FfmpegEncoder {
    /// `manifest_dir` holds temporary manifests; videos land in `output_dir`.
    pub fn new(settings: EncoderSettings, manifest_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            settings,
            manifest_dir,
            output_dir,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    /// Command-line arguments for one invocation.
    pub fn build_args(&self, manifest: &Path, output: &Path, fps: u32) -> Vec<OsString> {
        let s = &self.settings;
        let fps = fps.to_string();

        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-r".into(),
            fps.clone().into(),
            "-i".into(),
            manifest.into(),
            "-c:v".into(),
            s.codec.clone().into(),
        ];
        if !s.preset.is_empty() {
            args.extend(["-preset".into(), s.preset.clone().into()]);
        }
        if !s.bitrate.is_empty() {
            args.extend(["-b:v".into(), s.bitrate.clone().into()]);
        }
        if let Some(resolution) = &s.resolution {
            args.extend(["-s".into(), resolution.clone().into()]);
        }
        args.extend([
            "-pix_fmt".into(),
            s.pixel_format.clone().into(),
            "-r".into(),
            fps.into(),
            output.into(),
        ]);

        args
    }

    fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"), seq)
    }

    /// First free `<stem>[_n].<ext>` name in the output directory.
    async fn final_output_path(&self, stem: &str) -> PathBuf {
        let ext = &self.settings.container_extension;

        let mut candidate = self.output_dir.join(format!("{stem}.{ext}"));
        let mut n = 1;
        while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            candidate = self.output_dir.join(format!("{stem}_{n}.{ext}"));
            n += 1;
        }
        candidate
    }

    async fn run(
        &self,
        job: &EncodeJob,
        manifest: &Path,
        pending: &Path,
        cancel: &CancellationToken,
    ) -> Result<EncodeOutcome, EncoderError> {
        tokio::fs::write(manifest, render_manifest(&job.frames))
            .await
            .map_err(|source| EncoderError::Manifest {
                path: manifest.to_path_buf(),
                source,
            })?;
        debug!(manifest = %manifest.display(), entries = job.frames.len(), "Manifest written");

        let args = self.build_args(manifest, pending, job.fps);
        info!(
            binary = %self.settings.binary,
            args = ?args,
            "Running encoder"
        );

        let started = Instant::now();
        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == ErrorKind::NotFound {
                    EncoderError::NotFound(self.settings.binary.clone())
                } else {
                    EncoderError::Spawn {
                        binary: self.settings.binary.clone(),
                        source,
                    }
                }
            })?;

        // Readers are aborted on every early return.
        let mut stdout = AbortOnDropHandle::new(tokio::spawn(read_all(child.stdout.take())));
        let mut stderr = AbortOnDropHandle::new(tokio::spawn(read_all(child.stderr.take())));
        let deadline = tokio::time::Instant::now() + self.settings.timeout;

        let waited = tokio::select! {
            status = child.wait() => Waited::Done(status),
            _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Done(status) => status.map_err(EncoderError::Wait)?,
            Waited::TimedOut => {
                kill_child(&mut child, "timed out").await;
                return Ok(EncodeOutcome::TimedOut {
                    after: self.settings.timeout,
                });
            }
            Waited::Cancelled => {
                kill_child(&mut child, "cancelled").await;
                return Ok(EncodeOutcome::Cancelled);
            }
        };

        // Processes left behind by the encoder can hold its pipes open after
        // it exits, so draining them runs under the same deadline.
        let drained = tokio::select! {
            output = async { tokio::join!(&mut stdout, &mut stderr) } => Waited::Done(output),
            _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let (stdout, stderr) = match drained {
            Waited::Done((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
            Waited::TimedOut => {
                warn!(code = ?status.code(), "Encoder exited but its output pipes stayed open");
                return Ok(EncodeOutcome::TimedOut {
                    after: self.settings.timeout,
                });
            }
            Waited::Cancelled => return Ok(EncodeOutcome::Cancelled),
        };
        let elapsed = started.elapsed();

        if !status.success() {
            return Ok(EncodeOutcome::Failed {
                code: status.code(),
                stderr,
            });
        }
        debug!(stdout = %stdout, "Encoder output");

        let stem = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let output = self.final_output_path(&stem).await;
        if let Err(e) = tokio::fs::rename(pending, &output).await {
            return Ok(EncodeOutcome::Failed {
                code: status.code(),
                stderr: format!("failed to move {} into place: {}", pending.display(), e),
            });
        }

        Ok(EncodeOutcome::Success { output, elapsed })
    }
}

#[async_trait]
impl FrameEncoder for FfmpegEncoder {
    async fn encode(&self, job: EncodeJob, cancel: &CancellationToken) -> EncodeOutcome {
        let id = self.next_id();
        let manifest = self.manifest_dir.join(format!("manifest_{id}.txt"));
        let pending = self
            .output_dir
            .join(format!(".pending_{id}.{}", self.settings.container_extension));

        let outcome = match self.run(&job, &manifest, &pending, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => EncodeOutcome::LaunchFailed {
                reason: e.to_string(),
            },
        };

        match &outcome {
            EncodeOutcome::Success { output, elapsed } => info!(
                output = %output.display(),
                frames = job.frames.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Video created"
            ),
            EncodeOutcome::Failed { code, stderr } => error!(
                code = ?code,
                stderr = %stderr,
                "Encoder failed"
            ),
            EncodeOutcome::LaunchFailed { reason } => error!(reason = %reason, "Encoder could not run"),
            EncodeOutcome::TimedOut { after } => error!(
                timeout_secs = after.as_secs_f64(),
                "Encoder timed out and was killed"
            ),
            EncodeOutcome::Cancelled => warn!("Encoder cancelled by shutdown"),
        }

        // The pending file is gone after a successful rename.
        cleanup::remove_files([manifest, pending]).await;

        outcome
    }
}

/// Render a concat-demuxer manifest, one `file` line per entry.
pub fn render_manifest(frames: &[PathBuf]) -> String {
    let mut manifest = String::with_capacity(frames.len() * 64);
    for frame in frames {
        manifest.push_str("file '");
        manifest.push_str(&frame.to_string_lossy().replace('\'', r"'\''"));
        manifest.push_str("'\n");
    }
    manifest
}

async fn kill_child(child: &mut Child, reason: &str) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, reason = reason, "Failed to kill encoder");
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "Encoder pipe read failed");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
