//! Temporal resampling of an irregular frame timeline onto a fixed frame rate.
//!
//! A [`Batch`] is split into one-second buckets measured from its first
//! timestamp. Every bucket contributes exactly `target_fps` entries to the
//! output:
//!
//! - an empty bucket repeats the most recent available frame,
//! - a short bucket is padded with repeats of its own last frame,
//! - an over-full bucket keeps its first `target_fps` frames and drops the rest.
//!
//! Nothing here touches shared state; the carried frame is threaded through
//! [`resample_second`] explicitly.

use crate::ledger::FrameRecord;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::trace;

/// A non-empty ledger snapshot sorted by capture time.
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<FrameRecord>,
}

impl Batch {
    /// Sort a snapshot into a batch. Returns `None` for an empty snapshot.
    ///
    /// The sort is stable, so frames with equal timestamps keep their arrival
    /// order.
    pub fn from_records(mut records: Vec<FrameRecord>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        records.sort_by_key(|r| r.captured_at);
        Some(Self { records })
    }

    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Always false for a constructed batch.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first(&self) -> &FrameRecord {
        &self.records[0]
    }

    pub fn last(&self) -> &FrameRecord {
        &self.records[self.records.len() - 1]
    }

    /// Time between the first and last frame.
    pub fn span(&self) -> TimeDelta {
        self.last().captured_at - self.first().captured_at
    }

    /// Number of one-second buckets covered: `max(1, floor(span) + 1)`.
    pub fn total_seconds_in_span(&self) -> usize {
        let whole = self.span().num_seconds().max(0) as usize;
        (whole + 1).max(1)
    }

    /// Whole seconds between the batch start and `ts`.
    pub fn bucket_of(&self, ts: DateTime<Utc>) -> usize {
        (ts - self.first().captured_at).num_seconds().max(0) as usize
    }

    /// Frames grouped by bucket index; always `total_seconds_in_span` long.
    pub fn buckets(&self) -> Vec<&[FrameRecord]> {
        let total = self.total_seconds_in_span();
        let empty: &[FrameRecord] = &[];
        let mut buckets = vec![empty; total];

        let mut start = 0;
        while start < self.records.len() {
            let index = self.bucket_of(self.records[start].captured_at);
            let end = start
                + self.records[start..]
                    .iter()
                    .take_while(|r| self.bucket_of(r.captured_at) == index)
                    .count();
            buckets[index] = &self.records[start..end];
            start = end;
        }

        buckets
    }

    /// Distinct staged files referenced by this batch.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| seen.insert(r.path.as_path()))
            .map(|r| r.path.clone())
            .collect()
    }
}

/// Produce exactly `target_fps` entries for one bucket.
///
/// Returns the emitted entries and the frame to carry into the next second.
pub fn resample_second<'a>(
    bucket: &'a [FrameRecord],
    target_fps: usize,
    carry: &'a Path,
) -> (Vec<&'a Path>, &'a Path) {
    let Some(last_in_bucket) = bucket.last() else {
        return (vec![carry; target_fps], carry);
    };

    let mut emitted: Vec<&Path> = bucket
        .iter()
        .take(target_fps)
        .map(|r| r.path.as_path())
        .collect();

    if emitted.len() < target_fps {
        let pad = last_in_bucket.path.as_path();
        emitted.resize(target_fps, pad);
        (emitted, pad)
    } else {
        let next_carry = emitted.last().copied().unwrap_or(carry);
        (emitted, next_carry)
    }
}

/// Resample a batch onto `target_fps`.
///
/// The result always holds `batch.total_seconds_in_span() * target_fps`
/// entries.
pub fn resample(batch: &Batch, target_fps: usize) -> Vec<PathBuf> {
    let buckets = batch.buckets();
    let mut output = Vec::with_capacity(buckets.len() * target_fps);
    let mut carry = batch.first().path.as_path();

    for (second, bucket) in buckets.iter().enumerate() {
        let (emitted, next_carry) = resample_second(bucket, target_fps, carry);
        trace!(
            second = second,
            frames = bucket.len(),
            emitted = emitted.len(),
            "Resampled second"
        );
        output.extend(emitted.into_iter().map(Path::to_path_buf));
        carry = next_carry;
    }

    output
}
