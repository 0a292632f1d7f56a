//! Periodic assembly: ledger snapshot, resample, encode, cleanup.
//!
//! The loop awaits each tick's work before polling the timer again, so at most
//! one assembly (and one encoder process) is in flight. Ticks that come due
//! while an encode is still running are delayed rather than bunched up.

use crate::cleanup::{self, CleanupReport};
use crate::config::AssemblyConfig;
use crate::encoder::{EncodeJob, EncodeOutcome, FrameEncoder};
use crate::ledger::FrameLedger;
use crate::resampler::{resample, Batch};
use crate::stats::RecorderStats;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Assembly settings.
#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    pub interval: Duration,
    pub target_fps: u32,
}

impl From<&AssemblyConfig> for AssemblerSettings {
    fn from(config: &AssemblyConfig) -> Self {
        Self {
            interval: config.interval(),
            target_fps: config.target_fps,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// Nothing arrived since the previous tick
    Empty,

    /// Frames were discarded without encoding
    Skipped { frames: usize, reason: String },

    /// A video was written
    Encoded {
        frames: usize,
        output_frames: usize,
        output: PathBuf,
    },

    /// The encode attempt failed; the batch was discarded
    Failed {
        frames: usize,
        output_frames: usize,
        outcome: EncodeOutcome,
    },
}

/// Timer-driven orchestrator over the shared ledger.
pub struct Assembler {
    ledger: Arc<FrameLedger>,
    encoder: Arc<dyn FrameEncoder>,
    settings: AssemblerSettings,
    stats: Arc<RecorderStats>,
}

impl Assembler {
    pub fn new(
        ledger: Arc<FrameLedger>,
        encoder: Arc<dyn FrameEncoder>,
        settings: AssemblerSettings,
        stats: Arc<RecorderStats>,
    ) -> Self {
        Self {
            ledger,
            encoder,
            settings,
            stats,
        }
    }

    /// Tick every interval until `cancel` fires, then clean up pending frames.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs_f64(),
            target_fps = self.settings.target_fps,
            "Assembler started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(&cancel).await;
                    debug!(report = ?report, "Tick finished");
                }
            }
        }

        self.drain().await;
        info!("Assembler stopped");
    }

    /// Run one assembly pass.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickReport {
        let snapshot = self.ledger.take();
        self.stats.record_tick();

        let Some(batch) = Batch::from_records(snapshot) else {
            debug!("No frames cached, skipping video creation");
            return TickReport::Empty;
        };

        let frames = batch.len();
        let staged = batch.paths();
        info!(
            frames = frames,
            first = %batch.first().captured_at,
            last = %batch.last().captured_at,
            duration_secs = batch.span().num_milliseconds() as f64 / 1000.0,
            seconds = batch.total_seconds_in_span(),
            target_fps = self.settings.target_fps,
            "Processing frames for video"
        );

        let fps = self.settings.target_fps as usize;
        let sequence = match tokio::task::spawn_blocking(move || resample(&batch, fps)).await {
            Ok(sequence) => sequence,
            Err(e) => {
                error!(error = %e, "Resampling task failed");
                self.cleanup(staged).await;
                return TickReport::Skipped {
                    frames,
                    reason: format!("resampling failed: {e}"),
                };
            }
        };

        if sequence.is_empty() {
            warn!(frames = frames, "Resampling produced no frames, discarding batch");
            self.cleanup(staged).await;
            return TickReport::Skipped {
                frames,
                reason: "resampling produced no frames".to_string(),
            };
        }

        let output_frames = sequence.len();
        let job = EncodeJob {
            frames: sequence,
            fps: self.settings.target_fps,
        };
        let outcome = self.encoder.encode(job, cancel).await;

        // Failed batches are discarded, never retried.
        self.cleanup(staged).await;

        match outcome {
            EncodeOutcome::Success { output, elapsed } => {
                self.stats.record_video(elapsed);
                TickReport::Encoded {
                    frames,
                    output_frames,
                    output,
                }
            }
            outcome => {
                self.stats.record_encode_failure();
                TickReport::Failed {
                    frames,
                    output_frames,
                    outcome,
                }
            }
        }
    }

    /// Delete the staged files of every frame still waiting in the ledger.
    pub async fn drain(&self) -> CleanupReport {
        let pending = self.ledger.take();
        if pending.is_empty() {
            return CleanupReport::default();
        }

        info!(frames = pending.len(), "Discarding frames pending assembly");
        self.cleanup(pending.into_iter().map(|r| r.path).collect())
            .await
    }

    async fn cleanup(&self, paths: Vec<PathBuf>) -> CleanupReport {
        let report = cleanup::remove_files(paths).await;
        self.stats.record_cleanup(report.removed, report.failed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FrameRecord;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records every job and answers with a fixed outcome.
    struct RecordingEncoder {
        jobs: Mutex<Vec<EncodeJob>>,
        outcome: EncodeOutcome,
        existing_during_encode: Mutex<Vec<bool>>,
    }

    impl RecordingEncoder {
        fn new(outcome: EncodeOutcome) -> Arc<Self> {
            Arc::new(Self {
                jobs: Mutex::new(Vec::new()),
                outcome,
                existing_during_encode: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FrameEncoder for RecordingEncoder {
        async fn encode(&self, job: EncodeJob, _cancel: &CancellationToken) -> EncodeOutcome {
            self.existing_during_encode
                .lock()
                .extend(job.frames.iter().map(|p| p.exists()));
            self.jobs.lock().push(job);
            self.outcome.clone()
        }
    }

    fn success() -> EncodeOutcome {
        EncodeOutcome::Success {
            output: PathBuf::from("/videos/out.mp4"),
            elapsed: Duration::from_millis(5),
        }
    }

    fn assembler(
        ledger: Arc<FrameLedger>,
        encoder: Arc<RecordingEncoder>,
        fps: u32,
    ) -> (Assembler, Arc<RecorderStats>) {
        let stats = Arc::new(RecorderStats::new());
        let settings = AssemblerSettings {
            interval: Duration::from_secs(60),
            target_fps: fps,
        };
        (
            Assembler::new(ledger, encoder, settings, stats.clone()),
            stats,
        )
    }

    fn stage(dir: &TempDir, ledger: &FrameLedger, offsets_ms: &[i64]) -> Vec<PathBuf> {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        offsets_ms
            .iter()
            .enumerate()
            .map(|(i, ms)| {
                let path = dir.path().join(format!("frame_{i}.jpg"));
                std::fs::write(&path, b"jpeg").unwrap();
                ledger.append(FrameRecord::new(base + TimeDelta::milliseconds(*ms), path.clone()));
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_ledger_skips_encoder() {
        let ledger = Arc::new(FrameLedger::new());
        let encoder = RecordingEncoder::new(success());
        let (assembler, stats) = assembler(ledger, encoder.clone(), 2);

        let report = assembler.tick(&CancellationToken::new()).await;
        assert_eq!(report, TickReport::Empty);
        assert!(encoder.jobs.lock().is_empty());
        assert_eq!(stats.snapshot().ticks, 1);
        assert_eq!(stats.snapshot().files_removed, 0);
    }

    #[tokio::test]
    async fn test_successful_tick_encodes_then_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(FrameLedger::new());
        let staged = stage(&tmp, &ledger, &[0, 2200]);
        let encoder = RecordingEncoder::new(success());
        let (assembler, stats) = assembler(ledger.clone(), encoder.clone(), 3);

        let report = assembler.tick(&CancellationToken::new()).await;
        assert_eq!(
            report,
            TickReport::Encoded {
                frames: 2,
                output_frames: 9,
                output: PathBuf::from("/videos/out.mp4"),
            }
        );

        let jobs = encoder.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].fps, 3);
        assert_eq!(jobs[0].frames[..6], vec![staged[0].clone(); 6][..]);
        assert_eq!(jobs[0].frames[6..], vec![staged[1].clone(); 3][..]);

        // Frames existed while the encoder ran and are gone afterwards.
        assert!(encoder.existing_during_encode.lock().iter().all(|e| *e));
        assert!(staged.iter().all(|p| !p.exists()));
        assert!(ledger.is_empty());

        let snap = stats.snapshot();
        assert_eq!(snap.videos_written, 1);
        assert_eq!(snap.files_removed, 2);
    }

    #[tokio::test]
    async fn test_failed_encode_still_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(FrameLedger::new());
        let staged = stage(&tmp, &ledger, &[100, 400, 900]);
        let failure = EncodeOutcome::Failed {
            code: Some(1),
            stderr: "bad input".to_string(),
        };
        let encoder = RecordingEncoder::new(failure.clone());
        let (assembler, stats) = assembler(ledger, encoder, 2);

        let report = assembler.tick(&CancellationToken::new()).await;
        assert_eq!(
            report,
            TickReport::Failed {
                frames: 3,
                output_frames: 2,
                outcome: failure,
            }
        );
        assert!(staged.iter().all(|p| !p.exists()));
        assert_eq!(stats.snapshot().encode_failures, 1);
        assert_eq!(stats.snapshot().videos_written, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_cleans_up() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(FrameLedger::new());
        let staged = stage(&tmp, &ledger, &[0]);
        let encoder = RecordingEncoder::new(EncodeOutcome::LaunchFailed {
            reason: "not found".to_string(),
        });
        let (assembler, _) = assembler(ledger, encoder, 1);

        let report = assembler.tick(&CancellationToken::new()).await;
        assert!(matches!(report, TickReport::Failed { .. }));
        assert!(!staged[0].exists());
    }

    #[tokio::test]
    async fn test_frames_after_snapshot_wait_for_next_tick() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(FrameLedger::new());
        stage(&tmp, &ledger, &[0]);
        let encoder = RecordingEncoder::new(success());
        let (assembler, _) = assembler(ledger.clone(), encoder.clone(), 1);

        assembler.tick(&CancellationToken::new()).await;
        let late = tmp.path().join("late.jpg");
        std::fs::write(&late, b"jpeg").unwrap();
        ledger.append(FrameRecord::new(Utc::now(), late.clone()));
        assert!(late.exists());

        assembler.tick(&CancellationToken::new()).await;
        let jobs = encoder.jobs.lock();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].frames, vec![late.clone()]);
        assert!(!late.exists());
    }

    #[tokio::test]
    async fn test_drain_removes_pending_frames() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(FrameLedger::new());
        let staged = stage(&tmp, &ledger, &[0, 10, 20]);
        let encoder = RecordingEncoder::new(success());
        let (assembler, _) = assembler(ledger.clone(), encoder.clone(), 1);

        let report = assembler.drain().await;
        assert_eq!(report.removed, 3);
        assert!(staged.iter().all(|p| !p.exists()));
        assert!(ledger.is_empty());
        assert!(encoder.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_and_drains_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let ledger = Arc::new(FrameLedger::new());
        let staged = stage(&tmp, &ledger, &[0]);
        let encoder = RecordingEncoder::new(success());
        let (assembler, _) = assembler(ledger, encoder.clone(), 1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assembler.run(cancel).await;

        assert!(encoder.jobs.lock().is_empty());
        assert!(!staged[0].exists());
    }
}
