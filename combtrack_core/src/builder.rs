//! Layer-by-layer combinatorial track building.
//!
//! Seeds are grouped into processing units by the eta bin of their momentum
//! direction. Each unit runs through one [`CandCloner`]; with more than one
//! producer thread the units are dealt round-robin to scoped threads, each
//! owning its own clone engine. Results are merged by seed index, so the
//! output does not depend on the thread count.
//!
//! [`TrackBuilder::build_reference`] is a single-threaded, single-state path
//! with the same selection policy, kept to cross-check the batched engine.

use crate::cloner::{CandCloner, LayerStats, SeedSlot};
use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::event::Event;
use crate::hit_index::{EtaPhiBinning, LayerOfHits};
use crate::search::{extend_scalar, score_candidates, ScoreRequest};
use crate::track::{best_candidate, sort_by_rank, Candidate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Final candidates of one seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedTracks {
    pub seed: usize,

    /// Surviving candidates, best first
    pub candidates: Vec<Candidate>,

    /// Best candidate by (found hits, chi2), if any survived
    pub best: Option<Candidate>,
}

impl SeedTracks {
    fn new(seed: usize, candidates: Vec<Candidate>) -> Self {
        let best = best_candidate(&candidates).cloned();
        Self {
            seed,
            candidates,
            best,
        }
    }
}

/// Output of a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    /// One entry per seed, in seed order
    pub tracks: Vec<SeedTracks>,

    /// Branching statistics per searched layer
    pub layer_stats: Vec<LayerStats>,
}

impl BuildResult {
    pub fn best(&self, seed: usize) -> Option<&Candidate> {
        self.tracks.get(seed).and_then(|t| t.best.as_ref())
    }

    pub fn n_candidates(&self) -> usize {
        self.tracks.iter().map(|t| t.candidates.len()).sum()
    }
}

type UnitOutput = (Vec<SeedSlot>, Vec<LayerStats>);

/// Builds tracks for whole events.
#[derive(Debug, Clone)]
pub struct TrackBuilder {
    config: BuildConfig,
    binning: EtaPhiBinning,
}

impl TrackBuilder {
    pub fn new(config: BuildConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let binning = EtaPhiBinning::from_config(&config);
        Ok(Self { config, binning })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Builds the eta/phi index of every layer.
    pub fn index_layers(&self, event: &Event) -> Vec<Arc<LayerOfHits>> {
        event
            .layers
            .iter()
            .map(|l| Arc::new(LayerOfHits::build(l.radius, l.hits.clone(), self.binning)))
            .collect()
    }

    /// Seed indices grouped by the eta bin of their momentum direction,
    /// clamped into acceptance. Units come in bin order.
    pub fn seed_units(&self, event: &Event) -> Vec<Vec<usize>> {
        let det = self.binning.eta_det();
        let mut units: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (s, seed) in event.seeds.iter().enumerate() {
            let eta = seed.state.mom_eta();
            let eta = if eta.is_nan() { 0.0 } else { eta.clamp(-det, det) };
            let bin = self.binning.eta_bin(eta).unwrap_or(0);
            units.entry(bin).or_default().push(s);
        }
        units.into_values().collect()
    }

    /// Runs the batched, pipelined engine over `event`.
    pub fn build(&self, event: &Event) -> Result<BuildResult, BuildError> {
        event.validate(&self.config)?;
        let layers = self.index_layers(event);
        let units = self.seed_units(event);
        let threads = self.config.producer_threads.min(units.len()).max(1);
        info!(
            seeds = event.seeds.len(),
            hits = event.n_hits(),
            units = units.len(),
            threads,
            "Building tracks"
        );

        let config = &self.config;
        let layers = &layers;
        let outputs: Vec<Result<UnitOutput, BuildError>> = if threads == 1 {
            let mut cloner = CandCloner::new(config);
            units
                .iter()
                .map(|unit| process_unit(&mut cloner, unit, event, layers, config))
                .collect()
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        let mine: Vec<&Vec<usize>> = units.iter().skip(t).step_by(threads).collect();
                        scope.spawn(move || {
                            let mut cloner = CandCloner::new(config);
                            mine.into_iter()
                                .map(|unit| process_unit(&mut cloner, unit, event, layers, config))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .flat_map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                    .collect()
            })
        };

        let mut per_seed: Vec<Vec<Candidate>> = vec![Vec::new(); event.seeds.len()];
        let mut layer_stats = self.empty_stats(layers.len());
        for output in outputs {
            let (slots, stats) = output?;
            for slot in slots {
                per_seed[slot.seed] = slot.candidates;
            }
            for s in &stats {
                if let Some(total) = layer_stats.get_mut(s.layer - self.config.start_layer) {
                    total.merge(s);
                }
            }
        }
        Ok(self.finish(per_seed, layer_stats))
    }

    /// Single-threaded scalar build with the same selection policy.
    pub fn build_reference(&self, event: &Event) -> Result<BuildResult, BuildError> {
        event.validate(&self.config)?;
        let layers = self.index_layers(event);
        let capacity = self.config.max_cands_per_seed;
        let mut layer_stats = self.empty_stats(layers.len());
        let mut per_seed = Vec::with_capacity(event.seeds.len());

        for (s, seed) in event.seeds.iter().enumerate() {
            let mut cands = vec![Candidate::from_seed(s, seed)];
            for (layer_index, layer) in layers.iter().enumerate().skip(self.config.start_layer) {
                let mut children: Vec<(usize, Candidate)> = cands
                    .iter()
                    .enumerate()
                    .flat_map(|(parent, c)| {
                        extend_scalar(c, layer_index, layer, &self.config)
                            .into_iter()
                            .map(move |child| (parent, child))
                    })
                    .collect();
                let offered = children.len();
                children.sort_by(|a, b| a.1.rank_key().cmp_rank(&b.1.rank_key()));
                children.truncate(capacity);

                let mut has_child = vec![false; cands.len()];
                for (parent, _) in &children {
                    has_child[*parent] = true;
                }
                let n_parents = cands.len();
                let dead_ends = cands
                    .into_iter()
                    .zip(has_child)
                    .filter(|(_, had_child)| !had_child)
                    .map(|(mut c, _)| {
                        c.stalled = true;
                        c
                    });
                cands = children.into_iter().map(|(_, c)| c).chain(dead_ends).collect();
                sort_by_rank(&mut cands);
                cands.truncate(capacity);

                let n_backfilled = cands.iter().filter(|c| c.stalled).count();
                let n_children = cands.len() - n_backfilled;
                let stats = LayerStats {
                    layer: layer_index,
                    seeds: 1,
                    parents: n_parents,
                    proposals: offered,
                    discarded: offered - n_children,
                    children: n_children,
                    backfilled: n_backfilled,
                    survivors: cands.len(),
                };
                layer_stats[layer_index - self.config.start_layer].merge(&stats);
            }
            per_seed.push(cands);
        }
        Ok(self.finish(per_seed, layer_stats))
    }

    fn empty_stats(&self, n_layers: usize) -> Vec<LayerStats> {
        (self.config.start_layer..n_layers).map(LayerStats::new).collect()
    }

    fn finish(&self, per_seed: Vec<Vec<Candidate>>, layer_stats: Vec<LayerStats>) -> BuildResult {
        let tracks: Vec<SeedTracks> = per_seed
            .into_iter()
            .enumerate()
            .map(|(seed, candidates)| SeedTracks::new(seed, candidates))
            .collect();
        debug!(
            seeds = tracks.len(),
            with_track = tracks.iter().filter(|t| t.best.is_some()).count(),
            "Build finished"
        );
        BuildResult { tracks, layer_stats }
    }
}

/// Drives one unit of seeds through every searched layer.
fn process_unit(
    cloner: &mut CandCloner,
    unit: &[usize],
    event: &Event,
    layers: &[Arc<LayerOfHits>],
    config: &BuildConfig,
) -> Result<UnitOutput, BuildError> {
    let capacity = config.max_cands_per_seed;
    cloner.begin_eta_bin(
        unit.iter()
            .map(|&s| SeedSlot::new(s, vec![Candidate::from_seed(s, &event.seeds[s])], capacity))
            .collect(),
    );

    let mut stats = Vec::with_capacity(layers.len().saturating_sub(config.start_layer));
    for (layer_index, layer) in layers.iter().enumerate().skip(config.start_layer) {
        cloner.begin_layer(layer_index, Arc::clone(layer));
        let n_slots = cloner.n_slots();
        let mut start = 0;
        while start < n_slots {
            let end = (start + config.pipeline_granularity).min(n_slots);
            let proposals = {
                let requests: Vec<ScoreRequest<'_>> = (start..end)
                    .flat_map(|slot| {
                        cloner
                            .candidates(slot)
                            .iter()
                            .enumerate()
                            .map(move |(parent, candidate)| ScoreRequest { slot, parent, candidate })
                    })
                    .collect();
                score_candidates(&requests, layer, config)?
            };
            for proposal in proposals {
                cloner.add_cand(proposal);
            }
            cloner.end_iteration(end)?;
            start = end;
        }
        stats.push(cloner.end_layer()?);
    }
    Ok((cloner.end_eta_bin(), stats))
}
