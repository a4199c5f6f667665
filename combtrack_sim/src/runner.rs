//! Run harness: generate toy events, build tracks, score them against truth.

use crate::error::SimError;
use crate::generator::{SimTrack, ToyConfig, ToyEvent, ToyGenerator};
use combtrack_core::{BuildConfig, BuildResult, Candidate, LayerStats, TrackBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Fraction of a candidate's found hits that must come from the seed's
/// simulated track for the candidate to count as matched. A matched
/// candidate must also carry at least half of that track's hits.
pub const MATCH_PURITY: f32 = 0.75;

/// Truth match of one seed's best candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackMatch {
    pub seed: usize,
    pub n_found: usize,

    /// Found hits belonging to the seed's simulated track
    pub n_matched: usize,
    pub chi2: f32,
    pub matched: bool,
}

/// Scores the best candidate of `seed` against the event truth.
pub fn match_track(toy: &ToyEvent, seed: usize, best: Option<&Candidate>) -> TrackMatch {
    let mc_id = toy.event.seeds.get(seed).and_then(|s| s.mc_track_id);
    let Some(best) = best else {
        return TrackMatch {
            seed,
            n_found: 0,
            n_matched: 0,
            chi2: 0.0,
            matched: false,
        };
    };
    let n_matched = best
        .found_hits()
        .filter(|&(layer, idx)| {
            let hit_id = toy
                .event
                .layers
                .get(layer)
                .and_then(|l| l.hits.get(idx as usize))
                .and_then(|h| h.mc_track_id);
            mc_id.is_some() && hit_id == mc_id
        })
        .count();
    let purity = if best.n_found == 0 {
        0.0
    } else {
        n_matched as f32 / best.n_found as f32
    };
    let n_sim = mc_id
        .and_then(|id| toy.truth.get(id as usize))
        .map_or(0, SimTrack::n_hits);
    TrackMatch {
        seed,
        n_found: best.n_found,
        n_matched,
        chi2: best.chi2,
        matched: n_matched > 0 && purity >= MATCH_PURITY && 2 * n_matched >= n_sim,
    }
}

/// Aggregate figures over a set of track matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub seeds: usize,
    pub matched: usize,
    pub efficiency: f64,
    pub mean_found_hits: f64,
    pub mean_chi2: f64,
}

impl MatchSummary {
    pub fn from_matches(matches: &[TrackMatch]) -> Self {
        let seeds = matches.len();
        let matched = matches.iter().filter(|m| m.matched).count();
        let with_hits: Vec<&TrackMatch> = matches.iter().filter(|m| m.n_found > 0).collect();
        let mean = |f: &dyn Fn(&TrackMatch) -> f64| {
            if with_hits.is_empty() {
                0.0
            } else {
                with_hits.iter().map(|m| f(m)).sum::<f64>() / with_hits.len() as f64
            }
        };
        Self {
            seeds,
            matched,
            efficiency: if seeds == 0 { 0.0 } else { matched as f64 / seeds as f64 },
            mean_found_hits: mean(&|m| m.n_found as f64),
            mean_chi2: mean(&|m| m.chi2 as f64),
        }
    }
}

/// Comparison of the batched engine against the single-state reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceComparison {
    pub summary: MatchSummary,

    /// Seeds whose best candidates found the same hits in both builds
    pub identical_best: usize,
    pub elapsed_ms: f64,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub seed: u64,
    pub events: usize,
    pub hits: usize,
    pub candidates: usize,
    pub tracks: MatchSummary,

    /// Branching statistics per searched layer, summed over events
    pub layer_stats: Vec<LayerStats>,
    pub elapsed_ms: f64,
    pub reference: Option<ReferenceComparison>,
}

impl RunSummary {
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| SimError::Export(e.to_string()))?;
        std::fs::write(path.as_ref(), json)
            .map_err(|e| SimError::Export(format!("{}: {}", path.as_ref().display(), e)))
    }
}

/// Generates events and runs the builder over them.
pub struct Runner {
    builder: TrackBuilder,
    toy: ToyConfig,
    events: usize,
    with_reference: bool,
}

impl Runner {
    pub fn new(build: BuildConfig, toy: ToyConfig) -> Result<Self, SimError> {
        toy.validate()?;
        if build.start_layer > toy.n_layers {
            return Err(SimError::invalid_toy("n_layers", "fewer layers than the build start layer"));
        }
        Ok(Self {
            builder: TrackBuilder::new(build)?,
            toy,
            events: 1,
            with_reference: false,
        })
    }

    pub fn with_events(mut self, events: usize) -> Self {
        self.events = events;
        self
    }

    /// Also runs the single-state reference builder on every event.
    pub fn with_reference(mut self, enabled: bool) -> Self {
        self.with_reference = enabled;
        self
    }

    /// Toy settings of event `index`; seeds advance with the event index.
    pub fn event_config(&self, index: usize) -> ToyConfig {
        ToyConfig {
            seed: self.toy.seed.wrapping_add(index as u64),
            ..self.toy.clone()
        }
    }

    pub fn run(&self) -> Result<RunSummary, SimError> {
        let mut summary = RunSummary {
            seed: self.toy.seed,
            events: self.events,
            ..Default::default()
        };
        let mut matches = Vec::new();
        let mut reference_matches = Vec::new();
        let mut reference = self.with_reference.then(ReferenceComparison::default);

        for index in 0..self.events {
            let toy = ToyGenerator::new(self.event_config(index)).generate();
            summary.hits += toy.event.n_hits();

            let start = Instant::now();
            let result = self.builder.build(&toy.event)?;
            summary.elapsed_ms += start.elapsed().as_secs_f64() * 1e3;
            summary.candidates += result.n_candidates();
            merge_stats(&mut summary.layer_stats, &result.layer_stats);
            let event_matches = score_result(&toy, &result);
            debug!(
                event = index,
                seeds = toy.event.seeds.len(),
                matched = event_matches.iter().filter(|m| m.matched).count(),
                "Event built"
            );

            if let Some(cmp) = reference.as_mut() {
                let start = Instant::now();
                let reference_result = self.builder.build_reference(&toy.event)?;
                cmp.elapsed_ms += start.elapsed().as_secs_f64() * 1e3;
                cmp.identical_best += result
                    .tracks
                    .iter()
                    .zip(&reference_result.tracks)
                    .filter(|(a, b)| {
                        let hits = |c: &Option<Candidate>| c.as_ref().map(|c| c.found_hits().collect::<Vec<_>>());
                        hits(&a.best) == hits(&b.best)
                    })
                    .count();
                reference_matches.extend(score_result(&toy, &reference_result));
            }
            matches.extend(event_matches);
        }

        summary.tracks = MatchSummary::from_matches(&matches);
        if let Some(cmp) = reference.as_mut() {
            cmp.summary = MatchSummary::from_matches(&reference_matches);
        }
        summary.reference = reference;

        info!(
            events = summary.events,
            seeds = summary.tracks.seeds,
            efficiency = summary.tracks.efficiency,
            elapsed_ms = summary.elapsed_ms,
            "Run finished"
        );
        Ok(summary)
    }
}

fn score_result(toy: &ToyEvent, result: &BuildResult) -> Vec<TrackMatch> {
    result
        .tracks
        .iter()
        .map(|t| match_track(toy, t.seed, t.best.as_ref()))
        .collect()
}

fn merge_stats(total: &mut Vec<LayerStats>, event: &[LayerStats]) {
    if total.is_empty() {
        total.extend(event.iter().map(|s| LayerStats::new(s.layer)));
    }
    for (sum, s) in total.iter_mut().zip(event) {
        sum.merge(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use combtrack_core::{HitOnTrack, Seed};

    fn small_toy() -> ToyConfig {
        ToyConfig {
            n_tracks: 10,
            n_layers: 6,
            ..Default::default()
        }
    }

    #[test]
    fn test_match_counts_own_hits() {
        let toy = ToyGenerator::new(small_toy()).generate();
        let seed: &Seed = &toy.event.seeds[0];
        let track = &toy.truth[seed.mc_track_id.unwrap() as usize];

        let mut cand = Candidate::from_seed(0, seed);
        for layer in 3..6 {
            cand = cand.extended(layer, track.hits[layer].unwrap(), 1.0, seed.state.clone());
        }
        let m = match_track(&toy, 0, Some(&cand));
        assert_eq!(m.n_found, 6);
        assert_eq!(m.n_matched, 6);
        assert!(m.matched);

        // a candidate built on another track's hits is not matched
        let other = &toy.truth[(track.id as usize + 1) % toy.truth.len()];
        let mut wrong = Candidate::from_seed(0, seed);
        wrong.hits = (0..6)
            .map(|layer| HitOnTrack { layer, hit: other.hits[layer], chi2: 0.0 })
            .collect();
        wrong.n_found = 6;
        assert!(!match_track(&toy, 0, Some(&wrong)).matched);
        assert!(!match_track(&toy, 0, None).matched);
    }

    #[test]
    fn test_summary_means_skip_empty_tracks() {
        let matches = vec![
            TrackMatch { seed: 0, n_found: 6, n_matched: 6, chi2: 2.0, matched: true },
            TrackMatch { seed: 1, n_found: 4, n_matched: 1, chi2: 4.0, matched: false },
            TrackMatch { seed: 2, n_found: 0, n_matched: 0, chi2: 0.0, matched: false },
        ];
        let s = MatchSummary::from_matches(&matches);
        assert_eq!(s.seeds, 3);
        assert_eq!(s.matched, 1);
        assert!((s.mean_found_hits - 5.0).abs() < 1e-9);
        assert!((s.mean_chi2 - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_runner_rejects_short_geometry() {
        let build = BuildConfig { start_layer: 8, ..Default::default() };
        assert!(Runner::new(build, small_toy()).is_err());
    }

    #[test]
    fn test_event_seeds_advance() {
        let runner = Runner::new(BuildConfig::default(), small_toy()).unwrap();
        assert_eq!(runner.event_config(0).seed, 42);
        assert_eq!(runner.event_config(3).seed, 45);
    }
}
