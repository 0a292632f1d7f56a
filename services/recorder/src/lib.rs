//! Framereel Recorder
//!
//! Ingests a continuous, irregularly timed stream of camera frames over
//! WebSocket connections and, on a fixed interval, assembles everything that
//! arrived into a constant frame rate video using an external encoder.
//!
//! ## Architecture
//!
//! ```text
//! Devices (WebSocket)          Staging dir              Output dir
//! ┌──────────────┐           ┌──────────────┐         ┌──────────────┐
//! │ Ingest       │──write───▶│ frame_*.jpg  │         │ *.mp4        │
//! │ Listener     │           └──────────────┘         └──────────────┘
//! └──────────────┘                  ▲  │                     ▲
//!        │ append                   │  │ delete              │
//!        ▼                          │  ▼                     │
//! ┌──────────────┐           ┌──────────────┐         ┌──────────────┐
//! │ Frame        │──take────▶│ Assembler    │──job───▶│ Encoder      │
//! │ Ledger       │  (tick)   │ + Resampler  │         │ (ffmpeg)     │
//! └──────────────┘           └──────────────┘         └──────────────┘
//! ```
//!
//! The ledger is the only state shared between the listener and the
//! assembler. Each tick swaps it for an empty one, resamples the snapshot
//! onto the target frame rate, encodes, and deletes the staged frames whatever
//! the encode outcome.

pub mod assembler;
pub mod cleanup;
pub mod config;
pub mod encoder;
pub mod ingest;
pub mod ledger;
pub mod resampler;
pub mod staging;
pub mod stats;

pub use assembler::{Assembler, AssemblerSettings, TickReport};
pub use cleanup::{remove_files, CleanupReport};
pub use config::RecorderConfig;
pub use encoder::{EncodeJob, EncodeOutcome, EncoderSettings, FfmpegEncoder, FrameEncoder};
pub use ingest::IngestState;
pub use ledger::{FrameLedger, FrameRecord};
pub use resampler::{resample, resample_second, Batch};
pub use staging::{ensure_dir, StagingError, StagingStore};
pub use stats::{RecorderStats, StatsSnapshot};
