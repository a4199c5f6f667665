//! Toy event generator.
//!
//! Helix tracks leave a beam spot smeared in x, y and z, cross concentric
//! layers at `layer_spacing * (i + 1)` and leave one hit per layer, smeared
//! in r, phi and z. Each hit carries the covariance of that r-phi smearing
//! expressed in x/y. Seeds are formed from the first `layers_per_seed` hits
//! of every track that reaches them.
//!
//! All randomness comes from a `ChaCha8Rng` derived from the configured
//! seed, so an event is fully reproducible.

use crate::error::SimError;
use combtrack_core::config::CURVATURE_PER_TESLA;
use combtrack_core::kalman::transport_to_radius;
use combtrack_core::{Event, Hit, HitOnTrack, Layer, Seed, TrackState};
use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Transverse hit resolution (cm)
pub const HIT_ERR_XY: f32 = 0.01;

/// Longitudinal hit resolution (cm)
pub const HIT_ERR_Z: f32 = 0.1;

/// Radial hit resolution (cm)
pub const HIT_ERR_R: f32 = HIT_ERR_XY / 10.0;

/// Generator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToyConfig {
    /// Master seed of the event
    pub seed: u64,

    /// Simulated tracks per event
    pub n_tracks: usize,

    /// Number of concentric layers
    pub n_layers: usize,

    /// Radial distance between layers (cm); layer i sits at spacing * (i + 1)
    pub layer_spacing: f32,

    /// Transverse momentum range (GeV), drawn uniformly
    pub min_pt: f32,
    pub max_pt: f32,

    /// Solenoid field (T)
    pub b_field: f32,

    /// Hits per track used to form its seed
    pub layers_per_seed: usize,

    /// Relative smearing of the seed momentum
    pub seed_momentum_resolution: f32,

    /// Beam spot width in x/y and z (cm)
    pub beam_spot_xy: f32,
    pub beam_spot_z: f32,

    /// Uncorrelated hits added to each layer
    pub noise_hits_per_layer: usize,

    /// Noise hits are spread uniformly in eta within this bound
    pub noise_eta_max: f32,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            n_tracks: 100,
            n_layers: 10,
            layer_spacing: 4.0,
            min_pt: 0.5,
            max_pt: 10.0,
            b_field: 3.8,
            layers_per_seed: 3,
            seed_momentum_resolution: 0.02,
            beam_spot_xy: 0.1,
            beam_spot_z: 1.0,
            noise_hits_per_layer: 0,
            noise_eta_max: 1.0,
        }
    }
}

impl ToyConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        if self.n_layers == 0 {
            return Err(SimError::invalid_toy("n_layers", "must be at least 1"));
        }
        if self.layers_per_seed > self.n_layers {
            return Err(SimError::invalid_toy("layers_per_seed", "exceeds the number of layers"));
        }
        if !(self.layer_spacing.is_finite() && self.layer_spacing > 0.0) {
            return Err(SimError::invalid_toy("layer_spacing", "must be positive"));
        }
        if !(self.min_pt > 0.0 && self.min_pt <= self.max_pt && self.max_pt.is_finite()) {
            return Err(SimError::invalid_toy("min_pt", "must satisfy 0 < min_pt <= max_pt"));
        }
        if !self.b_field.is_finite() {
            return Err(SimError::invalid_toy("b_field", "must be finite"));
        }
        if !(self.seed_momentum_resolution >= 0.0 && self.noise_eta_max >= 0.0) {
            return Err(SimError::invalid_toy("seed_momentum_resolution", "resolutions must be non-negative"));
        }
        Ok(())
    }
}

/// Ground truth of one simulated track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimTrack {
    pub id: u32,
    pub charge: i32,
    pub vertex: Vector3<f32>,
    pub momentum: Vector3<f32>,

    /// Index of this track's hit on each layer; `None` once the track
    /// stopped reaching layers
    pub hits: Vec<Option<u32>>,
}

impl SimTrack {
    /// Layers this track left a hit on.
    pub fn n_hits(&self) -> usize {
        self.hits.iter().filter(|h| h.is_some()).count()
    }
}

/// Generated event with its truth record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyEvent {
    pub event: Event,
    pub truth: Vec<SimTrack>,
}

/// Deterministic toy generator.
pub struct ToyGenerator {
    config: ToyConfig,
    rng: ChaCha8Rng,
    kappa: f32,
}

impl ToyGenerator {
    pub fn new(config: ToyConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_mul(0x9e3779b97f4a7c15));
        let kappa = CURVATURE_PER_TESLA * config.b_field;
        Self { config, rng, kappa }
    }

    pub fn config(&self) -> &ToyConfig {
        &self.config
    }

    pub fn layer_radii(&self) -> Vec<f32> {
        (0..self.config.n_layers)
            .map(|i| self.config.layer_spacing * (i + 1) as f32)
            .collect()
    }

    /// Generates one event: all tracks first, then noise, then seeds.
    pub fn generate(&mut self) -> ToyEvent {
        let radii = self.layer_radii();
        let mut layers: Vec<Layer> = radii
            .iter()
            .map(|&radius| Layer { radius, hits: Vec::new() })
            .collect();

        let mut truth = Vec::with_capacity(self.config.n_tracks);
        let mut seed_states = Vec::with_capacity(self.config.n_tracks);
        for id in 0..self.config.n_tracks as u32 {
            let (track, seed_params) = self.simulate_track(id, &mut layers);
            truth.push(track);
            seed_states.push(seed_params);
        }

        for layer in layers.iter_mut() {
            for _ in 0..self.config.noise_hits_per_layer {
                let hit = self.noise_hit(layer.radius);
                layer.hits.push(hit);
            }
        }

        let seeds = truth
            .iter()
            .zip(seed_states)
            .filter_map(|(track, params)| params.map(|p| self.make_seed(track, p)))
            .collect();

        ToyEvent {
            event: Event { layers, seeds },
            truth,
        }
    }

    fn gaus(&mut self) -> f32 {
        self.rng.sample(StandardNormal)
    }

    /// Simulates one track through every layer it reaches. Returns the
    /// truth record and, when the track crossed all seed layers, its exact
    /// state on the last of them.
    fn simulate_track(&mut self, id: u32, layers: &mut [Layer]) -> (SimTrack, Option<[f32; 6]>) {
        let vertex = Vector3::new(
            self.config.beam_spot_xy * self.gaus(),
            self.config.beam_spot_xy * self.gaus(),
            self.config.beam_spot_z * self.gaus(),
        );
        let charge = if self.rng.gen::<f32>() > 0.5 { -1 } else { 1 };

        let pt = self.rng.gen_range(self.config.min_pt..=self.config.max_pt);
        let phi = FRAC_PI_2 * self.rng.gen::<f32>();
        let mut px = pt * phi.cos();
        let mut py = pt * phi.sin();
        if self.rng.gen::<f32>() > 0.5 {
            px = -px;
        }
        if self.rng.gen::<f32>() > 0.5 {
            py = -py;
        }
        // |eta| stays below about one
        let pz = pt * 2.3 * (self.rng.gen::<f32>() - 0.5);
        let momentum = Vector3::new(px, py, pz);

        let mut params = [vertex.x, vertex.y, vertex.z, px, py, pz];
        let mut hits = vec![None; layers.len()];
        let mut seed_params = (self.config.layers_per_seed == 0).then_some(params);
        for (i, layer) in layers.iter_mut().enumerate() {
            let Some(transport) = transport_to_radius(&params, charge, self.kappa, layer.radius) else {
                break;
            };
            params = transport.params;
            let hit = self.smeared_hit(Vector3::new(params[0], params[1], params[2])).with_mc_track(id);
            hits[i] = Some(layer.hits.len() as u32);
            layer.hits.push(hit);
            if i + 1 == self.config.layers_per_seed {
                seed_params = Some(params);
            }
        }

        let track = SimTrack {
            id,
            charge,
            vertex,
            momentum,
            hits,
        };
        (track, seed_params)
    }

    /// Smears a crossing point in r, phi and z.
    fn smeared_hit(&mut self, point: Vector3<f32>) -> Hit {
        let init_rad = point.x.hypot(point.y);
        let init_phi = point.y.atan2(point.x);
        let hit_z = point.z + HIT_ERR_Z * self.gaus();
        let hit_phi = init_phi + (HIT_ERR_XY / init_rad) * self.gaus();
        let hit_rad = init_rad + HIT_ERR_R * self.gaus();
        let position = Vector3::new(hit_rad * hit_phi.cos(), hit_rad * hit_phi.sin(), hit_z);
        Hit::new(position, rphi_covariance(&position))
    }

    fn noise_hit(&mut self, radius: f32) -> Hit {
        let phi = self.rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);
        let eta = self.rng.gen_range(-self.config.noise_eta_max..=self.config.noise_eta_max);
        let position = Vector3::new(radius * phi.cos(), radius * phi.sin(), radius * eta.sinh());
        Hit::new(position, rphi_covariance(&position))
    }

    /// Seed from the track's first hits, its state smeared around the truth
    /// on the last seed layer.
    fn make_seed(&mut self, track: &SimTrack, params: [f32; 6]) -> Seed {
        let res = self.config.seed_momentum_resolution;
        let position = Vector3::new(
            params[0] + HIT_ERR_XY * self.gaus(),
            params[1] + HIT_ERR_XY * self.gaus(),
            params[2] + HIT_ERR_Z * self.gaus(),
        );
        let true_momentum = Vector3::new(params[3], params[4], params[5]);
        let momentum = true_momentum.map(|p| p * (1.0 + res * self.gaus()));

        let mut diag = Vector6::new(
            HIT_ERR_XY * HIT_ERR_XY,
            HIT_ERR_XY * HIT_ERR_XY,
            HIT_ERR_Z * HIT_ERR_Z,
            0.0,
            0.0,
            0.0,
        );
        for i in 0..3 {
            diag[3 + i] = (res * true_momentum[i]).powi(2) + 1e-6;
        }

        let hits = track
            .hits
            .iter()
            .take(self.config.layers_per_seed)
            .enumerate()
            .map(|(layer, hit)| HitOnTrack { layer, hit: *hit, chi2: 0.0 })
            .collect();

        Seed {
            state: TrackState::new(position, momentum, Matrix6::from_diagonal(&diag), track.charge),
            hits,
            mc_track_id: Some(track.id),
        }
    }
}

/// Hit covariance in x/y/z for a point smeared in r and phi.
pub fn rphi_covariance(position: &Vector3<f32>) -> Matrix3<f32> {
    let (x, y) = (position.x, position.y);
    let r2 = x * x + y * y;
    let var_phi = HIT_ERR_XY * HIT_ERR_XY / r2;
    let var_r = HIT_ERR_R * HIT_ERR_R;
    let var_z = HIT_ERR_Z * HIT_ERR_Z;
    let cov_xy = x * y * (var_r / r2 - var_phi);
    Matrix3::new(
        x * x * var_r / r2 + y * y * var_phi, cov_xy, 0.0,
        cov_xy, x * x * var_phi + y * y * var_r / r2, 0.0,
        0.0, 0.0, var_z,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_same_seed_same_event() {
        let a = ToyGenerator::new(ToyConfig::default()).generate();
        let b = ToyGenerator::new(ToyConfig::default()).generate();
        assert_eq!(a, b);

        let c = ToyGenerator::new(ToyConfig { seed: 43, ..Default::default() }).generate();
        assert_ne!(a, c);
    }

    #[test]
    fn test_layers_and_hit_provenance() {
        let toy = ToyGenerator::new(ToyConfig {
            n_tracks: 20,
            noise_hits_per_layer: 5,
            ..Default::default()
        })
        .generate();

        assert_eq!(toy.event.layers.len(), 10);
        for (i, layer) in toy.event.layers.iter().enumerate() {
            assert_relative_eq!(layer.radius, 4.0 * (i + 1) as f32);
            assert_eq!(layer.hits.iter().filter(|h| h.mc_track_id.is_none()).count(), 5);
        }
        for track in &toy.truth {
            for (layer, hit) in track.hits.iter().enumerate() {
                if let Some(idx) = hit {
                    let hit = &toy.event.layers[layer].hits[*idx as usize];
                    assert_eq!(hit.mc_track_id, Some(track.id));
                    assert_relative_eq!(hit.r(), toy.event.layers[layer].radius, epsilon = 0.01);
                }
            }
        }
    }

    #[test]
    fn test_seeds_reference_first_hits() {
        let toy = ToyGenerator::new(ToyConfig::default()).generate();
        assert!(!toy.event.seeds.is_empty());
        for seed in &toy.event.seeds {
            let track = &toy.truth[seed.mc_track_id.unwrap() as usize];
            assert_eq!(seed.hits.len(), 3);
            for hot in &seed.hits {
                assert_eq!(hot.hit, track.hits[hot.layer]);
            }
            assert_relative_eq!(seed.state.r(), 12.0, epsilon = 0.1);
            assert_eq!(seed.state.charge, track.charge);
        }
        assert!(toy.event.validate(&combtrack_core::BuildConfig::default()).is_ok());
    }

    #[test]
    fn test_momentum_stays_in_acceptance() {
        let toy = ToyGenerator::new(ToyConfig { n_tracks: 500, ..Default::default() }).generate();
        for track in &toy.truth {
            let pt = track.momentum.x.hypot(track.momentum.y);
            assert!((0.5..=10.0).contains(&pt));
            assert!(track.momentum.z.abs() <= 1.15 * pt + 1e-4);
        }
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(ToyConfig::default().validate().is_ok());
        let bad = ToyConfig { layers_per_seed: 11, ..Default::default() };
        assert!(matches!(bad.validate(), Err(SimError::InvalidToy { field: "layers_per_seed", .. })));
        let bad = ToyConfig { min_pt: 5.0, max_pt: 1.0, ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_rphi_covariance_on_axis() {
        let cov = rphi_covariance(&Vector3::new(10.0, 0.0, 3.0));
        assert_relative_eq!(cov[(0, 0)], HIT_ERR_R * HIT_ERR_R, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], HIT_ERR_XY * HIT_ERR_XY, epsilon = 1e-10);
        assert_relative_eq!(cov[(0, 1)], 0.0);
        assert_relative_eq!(cov[(2, 2)], HIT_ERR_Z * HIT_ERR_Z);
    }

    proptest! {
        #[test]
        fn prop_events_are_consistent(seed in any::<u64>(), n_tracks in 1usize..30, noise in 0usize..10) {
            let toy = ToyGenerator::new(ToyConfig {
                seed,
                n_tracks,
                noise_hits_per_layer: noise,
                ..Default::default()
            })
            .generate();
            prop_assert_eq!(toy.truth.len(), n_tracks);
            prop_assert!(toy.event.validate(&combtrack_core::BuildConfig::default()).is_ok());
            for layer in &toy.event.layers {
                for hit in &layer.hits {
                    prop_assert!((hit.r() - layer.radius).abs() < 0.01);
                    prop_assert!(hit.covariance.iter().all(|v| v.is_finite()));
                }
            }
        }
    }
}
