//! CombTrack Core - SIMD-batched combinatorial Kalman-filter track building
//!
//! Reconstructs particle trajectories from hits on concentric detector layers:
//! 1. **Batch algebra**: structure-of-arrays small matrices, N lanes at a time
//! 2. **Hit index**: per-layer eta/phi binning for window queries
//! 3. **Kalman step**: helix propagation, chi2 scoring and update
//! 4. **Clone engine**: bounded best-K branching per seed, pipelined onto a
//!    worker thread with a per-layer barrier

pub mod batch_matrix;
pub mod builder;
pub mod cloner;
pub mod config;
pub mod error;
pub mod event;
pub mod hit;
pub mod hit_index;
pub mod kalman;
pub mod kalman_batch;
pub mod ranking;
pub mod search;
pub mod track;

// Re-export key types for convenience
pub use batch_matrix::{BatchMatrix, BatchVector, LANES};
pub use builder::{BuildResult, SeedTracks, TrackBuilder};
pub use cloner::{CandCloner, LayerStats, SeedSlot};
pub use config::{BuildConfig, CloneMode};
pub use error::{BuildError, ConfigError, MatrixError};
pub use event::{Event, Layer};
pub use hit::Hit;
pub use hit_index::{EtaPhiBinning, LayerOfHits, SearchWindow};
pub use ranking::BoundedRanking;
pub use search::Proposal;
pub use track::{Candidate, HitOnTrack, RankKey, Seed, TrackState};
