//! CombTrack toy simulation harness
//!
//! Generates reproducible toy events (helix tracks through concentric
//! layers, smeared hits, seeds from the first hits of each track), runs the
//! track builder over them and scores the result against the simulated truth.
//!
//! # Usage
//!
//! ```ignore
//! use combtrack_core::BuildConfig;
//! use combtrack_sim::{Runner, ToyConfig};
//!
//! let summary = Runner::new(BuildConfig::default(), ToyConfig::default())?
//!     .with_events(10)
//!     .run()?;
//! println!("efficiency {:.3}", summary.tracks.efficiency);
//! ```

pub mod error;
pub mod generator;
pub mod runner;

pub use error::SimError;
pub use generator::{SimTrack, ToyConfig, ToyEvent, ToyGenerator};
pub use runner::{match_track, MatchSummary, ReferenceComparison, RunSummary, Runner, TrackMatch};
