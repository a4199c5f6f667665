//! Track states, seeds and candidates.

use crate::hit::{eta_of, normalized_phi};
use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ============================================================================
// TRACK STATE
// ============================================================================

/// Helix state at a point: [x, y, z, px, py, pz] in cm and GeV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub params: Vector6<f32>,

    /// 6×6 covariance of `params`
    pub covariance: Matrix6<f32>,

    /// Charge in units of e; zero propagates as a straight line
    pub charge: i32,

    /// Cleared when propagation or update produced no usable state
    pub valid: bool,
}

impl TrackState {
    pub fn new(position: Vector3<f32>, momentum: Vector3<f32>, covariance: Matrix6<f32>, charge: i32) -> Self {
        let mut params = Vector6::zeros();
        params.fixed_rows_mut::<3>(0).copy_from(&position);
        params.fixed_rows_mut::<3>(3).copy_from(&momentum);
        Self {
            params,
            covariance,
            charge,
            valid: true,
        }
    }

    pub fn position(&self) -> Vector3<f32> {
        self.params.fixed_rows::<3>(0).into_owned()
    }

    pub fn momentum(&self) -> Vector3<f32> {
        self.params.fixed_rows::<3>(3).into_owned()
    }

    pub fn position_covariance(&self) -> Matrix3<f32> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn r(&self) -> f32 {
        self.params[0].hypot(self.params[1])
    }

    pub fn pos_phi(&self) -> f32 {
        self.params[1].atan2(self.params[0])
    }

    pub fn pos_eta(&self) -> f32 {
        eta_of(self.r(), self.params[2])
    }

    pub fn pt(&self) -> f32 {
        self.params[3].hypot(self.params[4])
    }

    /// Pseudorapidity of the momentum direction.
    pub fn mom_eta(&self) -> f32 {
        eta_of(self.pt(), self.params[5])
    }

    pub fn mom_phi(&self) -> f32 {
        normalized_phi(self.params[4].atan2(self.params[3]))
    }

    /// Marks the state invalid when any parameter or covariance entry is
    /// not finite.
    pub fn check_finite(&mut self) {
        if !(self.params.iter().all(|v| v.is_finite()) && self.covariance.iter().all(|v| v.is_finite())) {
            self.valid = false;
        }
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

/// One layer of a candidate's history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitOnTrack {
    pub layer: usize,

    /// Index into the layer's hits; `None` records a miss
    pub hit: Option<u32>,

    /// Chi2 contribution of this hit (zero for a miss)
    pub chi2: f32,
}

/// Initial track hypothesis: a state and the hits it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub state: TrackState,
    pub hits: Vec<HitOnTrack>,

    /// Simulated track this seed came from (validation only)
    pub mc_track_id: Option<u32>,
}

/// Ordering key of candidates and proposals: more found hits first, then
/// lower chi2. Ties are broken outside the key, by insertion order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankKey {
    pub n_found: usize,
    pub chi2: f32,
}

impl RankKey {
    /// `Less` means `self` ranks better.
    pub fn cmp_rank(&self, other: &Self) -> Ordering {
        other
            .n_found
            .cmp(&self.n_found)
            .then_with(|| self.chi2.total_cmp(&other.chi2))
    }
}

/// A partially or fully built track hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Seed this candidate descends from
    pub seed: usize,
    pub hits: Vec<HitOnTrack>,
    pub state: TrackState,

    /// Sum of hit chi2 contributions
    pub chi2: f32,
    pub n_found: usize,
    pub consecutive_misses: usize,

    /// Dead end kept as a finished candidate; never searched again
    pub stalled: bool,
}

impl Candidate {
    pub fn from_seed(seed_index: usize, seed: &Seed) -> Self {
        Self {
            seed: seed_index,
            hits: seed.hits.clone(),
            state: seed.state.clone(),
            chi2: seed.hits.iter().map(|h| h.chi2).sum(),
            n_found: seed.hits.iter().filter(|h| h.hit.is_some()).count(),
            consecutive_misses: 0,
            stalled: false,
        }
    }

    pub fn rank_key(&self) -> RankKey {
        RankKey {
            n_found: self.n_found,
            chi2: self.chi2,
        }
    }

    /// Whether the search should try to extend this candidate.
    pub fn is_active(&self) -> bool {
        !self.stalled && self.state.valid
    }

    /// Child with `hit` appended and the state replaced by `state`.
    pub fn extended(&self, layer: usize, hit: u32, hit_chi2: f32, state: TrackState) -> Self {
        let mut child = self.clone();
        child.hits.push(HitOnTrack {
            layer,
            hit: Some(hit),
            chi2: hit_chi2,
        });
        child.state = state;
        child.chi2 += hit_chi2;
        child.n_found += 1;
        child.consecutive_misses = 0;
        child
    }

    /// Child carried through `layer` without a hit.
    pub fn missed(&self, layer: usize, state: TrackState) -> Self {
        let mut child = self.clone();
        child.hits.push(HitOnTrack {
            layer,
            hit: None,
            chi2: 0.0,
        });
        child.state = state;
        child.consecutive_misses += 1;
        child
    }

    /// Hit indices that were found, in layer order.
    pub fn found_hits(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.hits.iter().filter_map(|h| h.hit.map(|idx| (h.layer, idx)))
    }
}

/// Stable best-first order of a candidate list.
pub fn sort_by_rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| a.rank_key().cmp_rank(&b.rank_key()));
}

/// Best candidate by rank key; the first one wins a tie.
pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().reduce(|best, c| {
        if c.rank_key().cmp_rank(&best.rank_key()) == Ordering::Less {
            c
        } else {
            best
        }
    })
}
