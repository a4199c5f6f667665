//! Build configuration: every tunable of the engine in one immutable struct.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::path::Path;

/// Conversion from tesla to curvature in 1/cm per GeV.
pub const CURVATURE_PER_TESLA: f32 = 0.299_792_458e-2;

/// Where candidate materialization runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneMode {
    /// A dedicated worker thread per clone engine, fed through a bounded queue
    Worker,
    /// On the producer thread, directly at each handoff
    Inline,
}

/// Configuration for the [`crate::TrackBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Maximum live candidates per seed after each layer (default: 10)
    pub max_cands_per_seed: usize,

    /// Hits with chi2 at or above this are incompatible (default: 15.0)
    pub chi2_cut: f32,

    /// Search window half-width in standard deviations (default: 3.0)
    pub n_sigma: f32,

    /// Lower clamp on the phi half-window in radians (default: 0.0)
    pub min_dphi: f32,

    /// Upper clamp on the phi half-window in radians (default: π)
    pub max_dphi: f32,

    /// Lower clamp on the eta half-window (default: 0.0)
    pub min_deta: f32,

    /// Upper clamp on the eta half-window (default: 1.0)
    pub max_deta: f32,

    /// Phi sectors per eta bin (default: 1260)
    pub n_phi_sectors: usize,

    /// Eta partitions of the first binning scheme (default: 11)
    pub n_eta_parts: usize,

    /// Detector acceptance is |eta| <= eta_det (default: 1.0)
    pub eta_det: f32,

    /// Seeds per unit of work handed to the clone engine (default: 4)
    pub pipeline_granularity: usize,

    /// Capacity of the clone engine's work queue, in seed ranges (default: 16)
    pub work_queue_depth: usize,

    /// Consecutive layers a candidate may pass without a hit (default: 1)
    pub max_consecutive_misses: usize,

    /// First layer searched; earlier layers hold the seed hits (default: 3)
    pub start_layer: usize,

    /// Solenoid field strength in tesla (default: 3.8)
    pub b_field: f32,

    /// Materialization placement (default: worker thread)
    pub clone_mode: CloneMode,

    /// Parallel producers, each owning a clone engine (default: 1)
    pub producer_threads: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_cands_per_seed: 10,
            chi2_cut: 15.0,
            n_sigma: 3.0,
            min_dphi: 0.0,
            max_dphi: PI,
            min_deta: 0.0,
            max_deta: 1.0,
            n_phi_sectors: 1260,
            n_eta_parts: 11,
            eta_det: 1.0,
            pipeline_granularity: 4,
            work_queue_depth: 16,
            max_consecutive_misses: 1,
            start_layer: 3,
            b_field: 3.8,
            clone_mode: CloneMode::Worker,
            producer_threads: 1,
        }
    }
}

impl BuildConfig {
    /// Curvature constant `kappa` such that omega = -q * kappa / pt.
    pub fn kappa(&self) -> f32 {
        CURVATURE_PER_TESLA * self.b_field
    }

    /// Loads a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every tunable for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cands_per_seed == 0 {
            return Err(ConfigError::invalid("max_cands_per_seed", "must be at least 1"));
        }
        if !(self.chi2_cut.is_finite() && self.chi2_cut > 0.0) {
            return Err(ConfigError::invalid("chi2_cut", "must be positive and finite"));
        }
        if !(self.n_sigma.is_finite() && self.n_sigma > 0.0) {
            return Err(ConfigError::invalid("n_sigma", "must be positive and finite"));
        }
        if !(self.min_dphi >= 0.0 && self.min_dphi <= self.max_dphi) {
            return Err(ConfigError::invalid("min_dphi", "must satisfy 0 <= min_dphi <= max_dphi"));
        }
        if !(self.min_deta >= 0.0 && self.min_deta <= self.max_deta) {
            return Err(ConfigError::invalid("min_deta", "must satisfy 0 <= min_deta <= max_deta"));
        }
        if self.n_phi_sectors == 0 {
            return Err(ConfigError::invalid("n_phi_sectors", "must be at least 1"));
        }
        if self.n_eta_parts == 0 {
            return Err(ConfigError::invalid("n_eta_parts", "must be at least 1"));
        }
        if !(self.eta_det.is_finite() && self.eta_det > 0.0) {
            return Err(ConfigError::invalid("eta_det", "must be positive and finite"));
        }
        if self.pipeline_granularity == 0 {
            return Err(ConfigError::invalid("pipeline_granularity", "must be at least 1"));
        }
        if self.work_queue_depth == 0 {
            return Err(ConfigError::invalid("work_queue_depth", "must be at least 1"));
        }
        if !self.b_field.is_finite() {
            return Err(ConfigError::invalid("b_field", "must be finite"));
        }
        if self.producer_threads == 0 {
            return Err(ConfigError::invalid("producer_threads", "must be at least 1"));
        }
        Ok(())
    }
}
