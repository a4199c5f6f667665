//! Builder input: concentric layers of hits and the seeds to extend.

use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::hit::Hit;
use crate::track::Seed;
use serde::{Deserialize, Serialize};

/// One concentric detection surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Transverse radius in cm
    pub radius: f32,
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Ordered by increasing radius
    pub layers: Vec<Layer>,
    pub seeds: Vec<Seed>,
}

impl Event {
    pub fn n_hits(&self) -> usize {
        self.layers.iter().map(|l| l.hits.len()).sum()
    }

    /// Checks layer ordering and every hit a seed refers to.
    pub fn validate(&self, config: &BuildConfig) -> Result<(), BuildError> {
        let mut previous = 0.0f32;
        for (i, layer) in self.layers.iter().enumerate() {
            if !(layer.radius.is_finite() && layer.radius > previous) {
                return Err(BuildError::invalid_event(format!(
                    "layer {} radius {} is not above the previous radius {}",
                    i, layer.radius, previous
                )));
            }
            previous = layer.radius;
        }
        if config.start_layer > self.layers.len() {
            return Err(BuildError::invalid_event(format!(
                "start layer {} beyond {} layers",
                config.start_layer,
                self.layers.len()
            )));
        }
        for (s, seed) in self.seeds.iter().enumerate() {
            for hot in &seed.hits {
                let Some(layer) = self.layers.get(hot.layer) else {
                    return Err(BuildError::invalid_event(format!(
                        "seed {} refers to missing layer {}",
                        s, hot.layer
                    )));
                };
                if let Some(idx) = hot.hit {
                    if idx as usize >= layer.hits.len() {
                        return Err(BuildError::invalid_event(format!(
                            "seed {} refers to hit {} of layer {} with {} hits",
                            s,
                            idx,
                            hot.layer,
                            layer.hits.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{HitOnTrack, TrackState};
    use nalgebra::{Matrix3, Matrix6, Vector3};

    fn layer(radius: f32, n_hits: usize) -> Layer {
        Layer {
            radius,
            hits: (0..n_hits)
                .map(|_| Hit::new(Vector3::new(radius, 0.0, 0.0), Matrix3::identity()))
                .collect(),
        }
    }

    fn seed_on(layer: usize, hit: u32) -> Seed {
        Seed {
            state: TrackState::new(Vector3::zeros(), Vector3::x(), Matrix6::identity(), 1),
            hits: vec![HitOnTrack { layer, hit: Some(hit), chi2: 0.0 }],
            mc_track_id: None,
        }
    }

    #[test]
    fn test_valid_event() {
        let event = Event {
            layers: vec![layer(4.0, 2), layer(8.0, 1), layer(12.0, 0)],
            seeds: vec![seed_on(0, 1)],
        };
        assert!(event.validate(&BuildConfig::default()).is_ok());
        assert_eq!(event.n_hits(), 3);
    }

    #[test]
    fn test_rejects_unordered_layers() {
        let event = Event {
            layers: vec![layer(8.0, 0), layer(4.0, 0)],
            seeds: Vec::new(),
        };
        let config = BuildConfig { start_layer: 0, ..Default::default() };
        assert!(matches!(event.validate(&config), Err(BuildError::InvalidEvent(_))));
    }

    #[test]
    fn test_rejects_dangling_seed_hit() {
        let event = Event {
            layers: vec![layer(4.0, 1), layer(8.0, 1), layer(12.0, 1)],
            seeds: vec![seed_on(1, 3)],
        };
        assert!(event.validate(&BuildConfig::default()).is_err());
    }

    #[test]
    fn test_rejects_start_beyond_layers() {
        let event = Event {
            layers: vec![layer(4.0, 1)],
            seeds: Vec::new(),
        };
        assert!(event.validate(&BuildConfig::default()).is_err());
    }
}
