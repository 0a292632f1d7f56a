//! Runtime counters shared between the ingest listener and the assembler.
//!
//! Counters live in atomics for snapshots (health endpoint, periodic stats
//! log) and every update is mirrored into the `metrics` facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Point-in-time copy of [`RecorderStats`].
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub bytes_received: u64,
    pub connections_opened: u64,
    pub connections_active: u64,
    pub ticks: u64,
    pub videos_written: u64,
    pub encode_failures: u64,
    pub files_removed: u64,
    pub cleanup_failures: u64,
}

/// Service-wide counters.
#[derive(Debug, Default)]
pub struct RecorderStats {
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_received: AtomicU64,
    connections_opened: AtomicU64,
    connections_active: AtomicU64,
    ticks: AtomicU64,
    videos_written: AtomicU64,
    encode_failures: AtomicU64,
    files_removed: AtomicU64,
    cleanup_failures: AtomicU64,
}

impl RecorderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("recorder_frames_received_total").increment(1);
        metrics::counter!("recorder_bytes_received_total").increment(bytes as u64);
    }

    pub fn record_dropped_frame(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("recorder_frames_dropped_total").increment(1);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        let active = self.connections_active.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("recorder_connections_total").increment(1);
        metrics::gauge!("recorder_connections_active").set(active as f64);
    }

    pub fn connection_closed(&self) {
        let previous = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        metrics::gauge!("recorder_connections_active").set(previous.saturating_sub(1) as f64);
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("recorder_ticks_total").increment(1);
    }

    pub fn record_video(&self, elapsed: Duration) {
        self.videos_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("recorder_videos_written_total").increment(1);
        metrics::histogram!("recorder_encode_seconds").record(elapsed.as_secs_f64());
    }

    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("recorder_encode_failures_total").increment(1);
    }

    pub fn record_cleanup(&self, removed: usize, failed: usize) {
        self.files_removed.fetch_add(removed as u64, Ordering::Relaxed);
        self.cleanup_failures.fetch_add(failed as u64, Ordering::Relaxed);
        metrics::counter!("recorder_files_removed_total").increment(removed as u64);
        metrics::counter!("recorder_cleanup_failures_total").increment(failed as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            videos_written: self.videos_written.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            files_removed: self.files_removed.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
        }
    }
}

/// Log a stats snapshot every `interval` until cancelled.
pub async fn run_stats_monitor(
    stats: Arc<RecorderStats>,
    pending: impl Fn() -> usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => log_stats(&stats.snapshot(), pending(), "Recorder stats"),
        }
    }
}

/// Emit one structured stats line.
pub fn log_stats(s: &StatsSnapshot, pending_frames: usize, message: &str) {
    info!(
        frames_received = s.frames_received,
        frames_dropped = s.frames_dropped,
        bytes_received = s.bytes_received,
        pending_frames = pending_frames,
        connections_active = s.connections_active,
        ticks = s.ticks,
        videos_written = s.videos_written,
        encode_failures = s.encode_failures,
        files_removed = s.files_removed,
        cleanup_failures = s.cleanup_failures,
        "{}",
        message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RecorderStats::new();
        stats.record_frame(100);
        stats.record_frame(50);
        stats.record_dropped_frame();
        stats.record_cleanup(3, 1);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.files_removed, 3);
        assert_eq!(snap.cleanup_failures, 1);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let stats = RecorderStats::new();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.connections_active, 0);
    }
}
