//! In-memory buffer of frames received since the last assembly tick.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;

/// One staged frame: when it arrived and where its bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    /// Receipt time, used as capture time
    pub captured_at: DateTime<Utc>,

    /// Location of the frame in the staging store
    pub path: PathBuf,
}

impl FrameRecord {
    pub fn new(captured_at: DateTime<Utc>, path: PathBuf) -> Self {
        Self { captured_at, path }
    }
}

/// Frames of the current epoch, in arrival order.
///
/// All access goes through a single lock. `take` swaps the buffer out under
/// that lock, so every append lands in exactly one epoch.
#[derive(Debug, Default)]
pub struct FrameLedger {
    frames: Mutex<Vec<FrameRecord>>,
}

impl FrameLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to the current epoch.
    pub fn append(&self, record: FrameRecord) {
        self.frames.lock().push(record);
    }

    /// Return every record of the current epoch and start a new, empty one.
    pub fn take(&self) -> Vec<FrameRecord> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn record(n: usize) -> FrameRecord {
        FrameRecord::new(Utc::now(), PathBuf::from(format!("frame_{n}.jpg")))
    }

    #[test]
    fn test_take_resets_epoch() {
        let ledger = FrameLedger::new();
        ledger.append(record(1));
        ledger.append(record(2));
        assert_eq!(ledger.len(), 2);

        let first = ledger.take();
        assert_eq!(first.len(), 2);
        assert!(ledger.is_empty());

        ledger.append(record(3));
        let second = ledger.take();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].path, PathBuf::from("frame_3.jpg"));
    }

    #[test]
    fn test_preserves_arrival_order() {
        let ledger = FrameLedger::new();
        for n in 0..10 {
            ledger.append(record(n));
        }
        let paths: Vec<_> = ledger.take().into_iter().map(|r| r.path).collect();
        let expected: Vec<_> = (0..10)
            .map(|n| PathBuf::from(format!("frame_{n}.jpg")))
            .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_concurrent_append_and_take_loses_nothing() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 2_000;

        let ledger = Arc::new(FrameLedger::new());
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        ledger.append(record(w * PER_WRITER + i));
                    }
                })
            })
            .collect();

        let mut epochs = Vec::new();
        while writers.iter().any(|h| !h.is_finished()) {
            epochs.push(ledger.take());
        }
        for handle in writers {
            handle.join().unwrap();
        }
        epochs.push(ledger.take());

        let mut seen = HashSet::new();
        let mut total = 0;
        for epoch in &epochs {
            for r in epoch {
                total += 1;
                assert!(seen.insert(r.path.clone()), "duplicate {:?}", r.path);
            }
        }
        assert_eq!(total, WRITERS * PER_WRITER);
        assert_eq!(seen.len(), WRITERS * PER_WRITER);
    }
}
