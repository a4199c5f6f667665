//! Candidate search: propagate each candidate to the layer, open an
//! error-scaled eta/phi window, and score the hits the index returns.

use crate::batch_matrix::LANES;
use crate::config::BuildConfig;
use crate::error::MatrixError;
use crate::hit_index::{LayerOfHits, SearchWindow};
use crate::kalman::{self, accept_chi2};
use crate::kalman_batch::{BatchedHits, BatchedStates};
use crate::track::{Candidate, RankKey, TrackState};
use nalgebra::Vector3;

/// A scored extension of one candidate, not yet materialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    /// Seed slot within the current processing unit
    pub slot: usize,

    /// Index of the parent in the seed's candidate list
    pub parent: usize,

    /// Hit on the layer, or `None` for a no-hit continuation
    pub hit: Option<u32>,

    pub hit_chi2: f32,

    /// Rank of the child this would produce
    pub key: RankKey,
}

/// A candidate to be scored, with its position in the unit.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRequest<'a> {
    pub slot: usize,
    pub parent: usize,
    pub candidate: &'a Candidate,
}

/// Window around the predicted position from linear error propagation of
/// the position covariance into eta and phi.
pub fn search_window(state: &TrackState, config: &BuildConfig) -> SearchWindow {
    let (x, y, z) = (state.params[0], state.params[1], state.params[2]);
    let r2 = x * x + y * y;
    let rho = (r2 + z * z).sqrt();
    let cov = state.position_covariance();

    let grad_phi = Vector3::new(-y / r2, x / r2, 0.0);
    let grad_eta = Vector3::new(-z * x / (r2 * rho), -z * y / (r2 * rho), 1.0 / rho);
    let var_phi = grad_phi.dot(&(cov * grad_phi));
    let var_eta = grad_eta.dot(&(cov * grad_eta));

    SearchWindow {
        eta: state.pos_eta(),
        deta: scaled_half_width(var_eta, config.n_sigma, config.min_deta, config.max_deta),
        phi: state.pos_phi(),
        dphi: scaled_half_width(var_phi, config.n_sigma, config.min_dphi, config.max_dphi),
    }
}

fn scaled_half_width(variance: f32, n_sigma: f32, min: f32, max: f32) -> f32 {
    let half = n_sigma * variance.max(0.0).sqrt();
    if half.is_finite() {
        half.clamp(min, max)
    } else {
        max
    }
}

fn proposal(slot: usize, parent: usize, cand: &Candidate, hit: Option<u32>, hit_chi2: f32) -> Proposal {
    Proposal {
        slot,
        parent,
        hit,
        hit_chi2,
        key: RankKey {
            n_found: cand.n_found + usize::from(hit.is_some()),
            chi2: cand.chi2 + hit_chi2,
        },
    }
}

/// Scores every active candidate in `requests` against `layer`, `LANES`
/// candidates at a time.
///
/// Proposals come back grouped by request, in request order; within a
/// request, in hit enumeration order followed by the no-hit continuation.
/// A candidate that cannot reach the layer yields no proposals.
pub fn score_candidates(
    requests: &[ScoreRequest<'_>],
    layer: &LayerOfHits,
    config: &BuildConfig,
) -> Result<Vec<Proposal>, MatrixError> {
    let kappa = config.kappa();
    let active: Vec<&ScoreRequest<'_>> = requests.iter().filter(|r| r.candidate.is_active()).collect();
    let mut proposals = Vec::new();

    for chunk in active.chunks(LANES) {
        let mut states = BatchedStates::<LANES>::load(chunk.iter().map(|r| &r.candidate.state));
        states.propagate_to_radius(layer.radius(), kappa);

        let lane_hits: Vec<Vec<u32>> = (0..chunk.len())
            .map(|lane| {
                if states.is_valid(lane) {
                    layer.query(&search_window(&states.state(lane), config))
                } else {
                    Vec::new()
                }
            })
            .collect();
        let rounds = lane_hits.iter().map(Vec::len).max().unwrap_or(0);

        let mut lane_props: Vec<Vec<Proposal>> = vec![Vec::new(); chunk.len()];
        let mut hits = BatchedHits::<LANES>::new();
        for round in 0..rounds {
            hits.clear();
            for (lane, list) in lane_hits.iter().enumerate() {
                if let Some(&idx) = list.get(round) {
                    hits.set(lane, layer.hit(idx));
                }
            }
            let chi2 = states.compute_chi2(&hits)?;
            for (lane, req) in chunk.iter().enumerate() {
                let Some(&idx) = lane_hits[lane].get(round) else {
                    continue;
                };
                if accept_chi2(chi2[lane], config.chi2_cut) {
                    lane_props[lane].push(proposal(req.slot, req.parent, req.candidate, Some(idx), chi2[lane]));
                }
            }
        }

        for (lane, req) in chunk.iter().enumerate() {
            if !states.is_valid(lane) {
                continue;
            }
            let cand = req.candidate;
            if lane_props[lane].is_empty() && cand.consecutive_misses < config.max_consecutive_misses {
                lane_props[lane].push(proposal(req.slot, req.parent, cand, None, 0.0));
            }
            proposals.append(&mut lane_props[lane]);
        }
    }
    Ok(proposals)
}

/// Single-state extension of one candidate onto `layer`: every compatible
/// hit yields an updated child, or a no-hit child if none is compatible.
pub fn extend_scalar(cand: &Candidate, layer_index: usize, layer: &LayerOfHits, config: &BuildConfig) -> Vec<Candidate> {
    if !cand.is_active() {
        return Vec::new();
    }
    let predicted = kalman::propagate(&cand.state, layer.radius(), config.kappa());
    if !predicted.valid {
        return Vec::new();
    }
    let mut children: Vec<Candidate> = layer
        .query(&search_window(&predicted, config))
        .into_iter()
        .filter_map(|idx| {
            let hit = layer.hit(idx);
            let chi2 = kalman::compute_chi2(&predicted, hit);
            if !accept_chi2(chi2, config.chi2_cut) {
                return None;
            }
            let updated = kalman::update(&predicted, hit);
            updated.valid.then(|| cand.extended(layer_index, idx, chi2, updated))
        })
        .collect();
    if children.is_empty() && cand.consecutive_misses < config.max_consecutive_misses {
        children.push(cand.missed(layer_index, predicted));
    }
    children
}
