//! Candidate cloning engine.
//!
//! Per processing unit (the seeds of one eta bin) the engine runs
//!
//! ```text
//! begin_eta_bin -> [begin_layer -> (add_cand* end_iteration)* -> end_layer]* -> end_eta_bin
//! ```
//!
//! The producer scores candidates and feeds proposals into each seed's
//! bounded ranking with `add_cand`. Once `pipeline_granularity` seeds are
//! fully scored, `end_iteration` hands them off for materialization. In
//! worker mode the hand-off moves the seeds' [`SeedSlot`]s through a bounded
//! channel to a long-lived worker thread and the results come back on a
//! second channel, so the producer and the worker never share a seed and no
//! lock guards it. `end_layer` is the layer barrier: it hands off the
//! remaining seeds and blocks until every slot is back.

use crate::batch_matrix::LANES;
use crate::config::{BuildConfig, CloneMode};
use crate::error::{BuildError, MatrixError};
use crate::hit_index::LayerOfHits;
use crate::kalman_batch::{BatchedHits, BatchedStates};
use crate::ranking::BoundedRanking;
use crate::search::Proposal;
use crate::track::{sort_by_rank, Candidate, TrackState};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

// ============================================================================
// SEED SLOTS AND STATISTICS
// ============================================================================

/// Everything the engine owns for one seed: its live candidates and the
/// ranking of the proposals scored for the current layer.
#[derive(Debug, Clone)]
pub struct SeedSlot {
    pub seed: usize,
    pub candidates: Vec<Candidate>,
    ranking: BoundedRanking<Proposal>,
}

impl SeedSlot {
    pub fn new(seed: usize, candidates: Vec<Candidate>, capacity: usize) -> Self {
        Self {
            seed,
            candidates,
            ranking: BoundedRanking::new(capacity),
        }
    }

    /// Proposals currently ranked for this seed.
    pub fn pending(&self) -> usize {
        self.ranking.len()
    }
}

/// Branching statistics of one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    pub layer: usize,
    pub seeds: usize,

    /// Candidates entering the layer
    pub parents: usize,

    /// Proposals offered to the rankings
    pub proposals: usize,

    /// Proposals that did not become a surviving child
    pub discarded: usize,

    /// Surviving candidates extended on this layer (hit or miss)
    pub children: usize,

    /// Surviving stalled candidates
    pub backfilled: usize,

    /// Candidates leaving the layer
    pub survivors: usize,
}

impl LayerStats {
    pub fn new(layer: usize) -> Self {
        Self {
            layer,
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: &LayerStats) {
        self.seeds += other.seeds;
        self.parents += other.parents;
        self.proposals += other.proposals;
        self.discarded += other.discarded;
        self.children += other.children;
        self.backfilled += other.backfilled;
        self.survivors += other.survivors;
    }
}

// ============================================================================
// MATERIALIZATION
// ============================================================================

/// Turns a seed's ranked proposals into its candidate list for the next
/// layer.
///
/// Proposals are taken best first. Hit proposals clone the parent and apply
/// a batched propagate and update; no-hit proposals clone the propagated
/// parent with a miss recorded. Parents that produced no child are marked
/// stalled and ranked together with the children, so a finished candidate
/// is only dropped for K better ones. The final list is ordered best first.
pub fn materialize(
    slot: &mut SeedSlot,
    layer_index: usize,
    layer: &LayerOfHits,
    config: &BuildConfig,
) -> Result<LayerStats, MatrixError> {
    let capacity = config.max_cands_per_seed;
    let discarded = slot.ranking.discarded();
    let ranked = slot.ranking.drain_sorted();
    let parents = std::mem::take(&mut slot.candidates);
    let mut has_child = vec![false; parents.len()];
    let mut children: Vec<Candidate> = Vec::with_capacity(capacity);

    for chunk in ranked.chunks(LANES) {
        let mut states = BatchedStates::<LANES>::load(chunk.iter().map(|(_, p)| &parents[p.parent].state));
        states.propagate_to_radius(layer.radius(), config.kappa());
        let propagated: Vec<TrackState> = (0..chunk.len()).map(|lane| states.state(lane)).collect();

        let mut hits = BatchedHits::<LANES>::new();
        for (lane, (_, p)) in chunk.iter().enumerate() {
            if let Some(idx) = p.hit {
                hits.set(lane, layer.hit(idx));
            }
        }
        states.update(&hits)?;

        for (lane, (_, p)) in chunk.iter().enumerate() {
            let parent = &parents[p.parent];
            let child = match p.hit {
                Some(idx) => {
                    let state = states.state(lane);
                    if !state.valid {
                        continue;
                    }
                    parent.extended(layer_index, idx, p.hit_chi2, state)
                }
                None => {
                    if !propagated[lane].valid {
                        continue;
                    }
                    parent.missed(layer_index, propagated[lane].clone())
                }
            };
            has_child[p.parent] = true;
            children.push(child);
        }
    }

    let n_parents = parents.len();
    let n_proposals = ranked.len() + discarded;
    let dead_ends = parents
        .into_iter()
        .zip(has_child)
        .filter(|(_, had_child)| !had_child)
        .map(|(mut cand, _)| {
            cand.stalled = true;
            cand
        });
    children.extend(dead_ends);
    sort_by_rank(&mut children);
    children.truncate(capacity);

    let n_backfilled = children.iter().filter(|c| c.stalled).count();
    let n_children = children.len() - n_backfilled;
    slot.candidates = children;

    Ok(LayerStats {
        layer: layer_index,
        seeds: 1,
        parents: n_parents,
        proposals: n_proposals,
        discarded: n_proposals - n_children,
        children: n_children,
        backfilled: n_backfilled,
        survivors: slot.candidates.len(),
    })
}

// ============================================================================
// WORKER THREAD
// ============================================================================

struct WorkItem {
    layer_index: usize,
    layer: Arc<LayerOfHits>,
    slots: Vec<(usize, SeedSlot)>,
}

type WorkResult = Result<(Vec<(usize, SeedSlot)>, LayerStats), MatrixError>;

fn process(item: WorkItem, config: &BuildConfig) -> WorkResult {
    let mut stats = LayerStats::new(item.layer_index);
    let mut slots = item.slots;
    for (_, slot) in slots.iter_mut() {
        stats.merge(&materialize(slot, item.layer_index, &item.layer, config)?);
    }
    Ok((slots, stats))
}

fn run_worker(config: BuildConfig, work_rx: Receiver<WorkItem>, result_tx: Sender<WorkResult>) {
    while let Ok(item) = work_rx.recv() {
        trace!(layer = item.layer_index, seeds = item.slots.len(), "Materializing seed range");
        if result_tx.send(process(item, &config)).is_err() {
            break;
        }
    }
}

struct WorkerHandle {
    work_tx: Option<Sender<WorkItem>>,
    result_rx: Receiver<WorkResult>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn(config: &BuildConfig) -> Self {
        let (work_tx, work_rx) = bounded(config.work_queue_depth);
        let (result_tx, result_rx) = unbounded();
        let config = config.clone();
        let join = std::thread::spawn(move || run_worker(config, work_rx, result_tx));
        Self {
            work_tx: Some(work_tx),
            result_rx,
            join: Some(join),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // closing the queue ends the worker loop
        self.work_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

// ============================================================================
// CLONE ENGINE
// ============================================================================

/// Bounded-branching clone engine for one producer.
pub struct CandCloner {
    config: BuildConfig,
    worker: Option<WorkerHandle>,
    slots: Vec<Option<SeedSlot>>,
    layer: Option<(usize, Arc<LayerOfHits>)>,
    handed_off: usize,
    outstanding: usize,
    stats: LayerStats,
}

impl CandCloner {
    pub fn new(config: &BuildConfig) -> Self {
        let worker = match config.clone_mode {
            CloneMode::Worker => Some(WorkerHandle::spawn(config)),
            CloneMode::Inline => None,
        };
        Self {
            config: config.clone(),
            worker,
            slots: Vec::new(),
            layer: None,
            handed_off: 0,
            outstanding: 0,
            stats: LayerStats::default(),
        }
    }

    /// Takes ownership of the seeds of one processing unit.
    pub fn begin_eta_bin(&mut self, slots: Vec<SeedSlot>) {
        debug_assert!(self.layer.is_none() && self.outstanding == 0);
        self.slots = slots.into_iter().map(Some).collect();
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Live candidates of a slot the producer still owns.
    pub fn candidates(&self, slot: usize) -> &[Candidate] {
        match &self.slots[slot] {
            Some(s) => &s.candidates,
            None => &[],
        }
    }

    pub fn begin_layer(&mut self, layer_index: usize, layer: Arc<LayerOfHits>) {
        debug_assert!(self.outstanding == 0);
        self.layer = Some((layer_index, layer));
        self.handed_off = 0;
        self.stats = LayerStats::new(layer_index);
    }

    /// Offers a proposal to its seed's ranking.
    pub fn add_cand(&mut self, proposal: Proposal) {
        match self.slots.get_mut(proposal.slot).and_then(Option::as_mut) {
            Some(slot) => {
                slot.ranking.push(proposal.key, proposal);
            }
            None => debug_assert!(false, "proposal for slot {} after hand-off", proposal.slot),
        }
    }

    /// Seeds `[0, scored_through)` have all their proposals. Hands off the
    /// not yet handed seeds in whole multiples of the pipeline granularity.
    pub fn end_iteration(&mut self, scored_through: usize) -> Result<(), BuildError> {
        let range = self.config.pipeline_granularity;
        let ready = scored_through.min(self.slots.len()).saturating_sub(self.handed_off);
        if ready >= range {
            let end = self.handed_off + ready / range * range;
            self.hand_off(end)?;
        }
        self.collect_ready()
    }

    /// Layer barrier: hands off the remaining seeds and waits for all of
    /// them. Returns the layer's branching statistics.
    pub fn end_layer(&mut self) -> Result<LayerStats, BuildError> {
        if self.handed_off < self.slots.len() {
            self.hand_off(self.slots.len())?;
        }
        while self.outstanding > 0 {
            let result = match &self.worker {
                Some(worker) => worker.result_rx.recv().map_err(|_| BuildError::WorkerDisconnected)?,
                None => break,
            };
            self.outstanding -= 1;
            self.restore(result)?;
        }
        self.layer = None;
        let stats = std::mem::take(&mut self.stats);
        debug!(
            layer = stats.layer,
            seeds = stats.seeds,
            proposals = stats.proposals,
            survivors = stats.survivors,
            "Layer done"
        );
        Ok(stats)
    }

    /// Returns the seeds of the unit, with their final candidates.
    pub fn end_eta_bin(&mut self) -> Vec<SeedSlot> {
        std::mem::take(&mut self.slots).into_iter().flatten().collect()
    }

    fn hand_off(&mut self, end: usize) -> Result<(), BuildError> {
        let (layer_index, layer) = match &self.layer {
            Some((idx, layer)) => (*idx, Arc::clone(layer)),
            None => return Ok(()),
        };
        let slots: Vec<(usize, SeedSlot)> = (self.handed_off..end)
            .filter_map(|i| self.slots[i].take().map(|slot| (i, slot)))
            .collect();
        self.handed_off = end;
        let item = WorkItem {
            layer_index,
            layer,
            slots,
        };

        match &self.worker {
            Some(worker) => {
                let tx = worker.work_tx.as_ref().ok_or(BuildError::WorkerDisconnected)?;
                tx.send(item).map_err(|_| BuildError::WorkerDisconnected)?;
                self.outstanding += 1;
                Ok(())
            }
            None => {
                let result = process(item, &self.config);
                self.restore(result)
            }
        }
    }

    /// Puts back whatever the worker has already finished.
    fn collect_ready(&mut self) -> Result<(), BuildError> {
        while self.outstanding > 0 {
            let Some(worker) = &self.worker else {
                break;
            };
            match worker.result_rx.try_recv() {
                Ok(result) => {
                    self.outstanding -= 1;
                    self.restore(result)?;
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn restore(&mut self, result: WorkResult) -> Result<(), BuildError> {
        let (slots, stats) = result?;
        for (i, slot) in slots {
            self.slots[i] = Some(slot);
        }
        self.stats.merge(&stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::Hit;
    use crate::hit_index::EtaPhiBinning;
    use crate::track::{RankKey, Seed};
    use nalgebra::{Matrix3, Matrix6, Vector3};

    fn config(mode: CloneMode, capacity: usize) -> BuildConfig {
        BuildConfig {
            b_field: 0.0,
            start_layer: 0,
            max_cands_per_seed: capacity,
            clone_mode: mode,
            pipeline_granularity: 2,
            ..Default::default()
        }
    }

    fn layer(config: &BuildConfig) -> Arc<LayerOfHits> {
        let hits = (0..6)
            .map(|i| {
                Hit::new(
                    Vector3::new(10.0, 0.001 * i as f32, 0.0),
                    Matrix3::from_diagonal(&Vector3::new(1e-4, 1e-4, 1e-2)),
                )
            })
            .collect();
        Arc::new(LayerOfHits::build(10.0, hits, EtaPhiBinning::from_config(config)))
    }

    fn slot(seed: usize, capacity: usize) -> SeedSlot {
        let state = crate::track::TrackState::new(
            Vector3::zeros(),
            Vector3::new(1.0, 0.0, 0.0),
            Matrix6::identity() * 1e-4,
            1,
        );
        let seed_def = Seed {
            state,
            hits: Vec::new(),
            mc_track_id: None,
        };
        SeedSlot::new(seed, vec![Candidate::from_seed(seed, &seed_def)], capacity)
    }

    fn hit_proposal(slot: usize, hit: u32, chi2: f32) -> Proposal {
        Proposal {
            slot,
            parent: 0,
            hit: Some(hit),
            hit_chi2: chi2,
            key: RankKey { n_found: 1, chi2 },
        }
    }

    fn run_layer(mode: CloneMode, capacity: usize, n_seeds: usize) -> (Vec<SeedSlot>, LayerStats) {
        let config = config(mode, capacity);
        let layer = layer(&config);
        let mut cloner = CandCloner::new(&config);
        cloner.begin_eta_bin((0..n_seeds).map(|s| slot(s, capacity)).collect());
        cloner.begin_layer(0, layer);
        for s in 0..n_seeds {
            for h in 0..6u32 {
                cloner.add_cand(hit_proposal(s, h, (5 - h) as f32 * 0.5));
            }
            cloner.end_iteration(s + 1).unwrap();
        }
        let stats = cloner.end_layer().unwrap();
        (cloner.end_eta_bin(), stats)
    }

    #[test]
    fn test_survivors_are_bounded_and_best() {
        let (slots, stats) = run_layer(CloneMode::Worker, 3, 5);
        assert_eq!(slots.len(), 5);
        for slot in &slots {
            assert_eq!(slot.candidates.len(), 3);
            let hits: Vec<Option<u32>> = slot.candidates.iter().map(|c| c.hits[0].hit).collect();
            // lowest chi2 comes from the highest hit index
            assert_eq!(hits, vec![Some(5), Some(4), Some(3)]);
        }
        assert_eq!(stats.seeds, 5);
        assert_eq!(stats.proposals, 30);
        assert_eq!(stats.discarded, 15);
        assert_eq!(stats.survivors, 15);
    }

    #[test]
    fn test_worker_and_inline_agree() {
        let (worker, worker_stats) = run_layer(CloneMode::Worker, 4, 7);
        let (inline, inline_stats) = run_layer(CloneMode::Inline, 4, 7);
        assert_eq!(worker_stats, inline_stats);
        for (a, b) in worker.iter().zip(&inline) {
            assert_eq!(a.seed, b.seed);
            assert_eq!(a.candidates, b.candidates);
        }
    }

    #[test]
    fn test_hand_off_rounds_down_to_granularity() {
        let config = config(CloneMode::Inline, 2);
        let mut cloner = CandCloner::new(&config);
        cloner.begin_eta_bin((0..5).map(|s| slot(s, 2)).collect());
        cloner.begin_layer(0, layer(&config));
        cloner.end_iteration(1).unwrap();
        assert_eq!(cloner.handed_off, 0);
        cloner.end_iteration(3).unwrap();
        assert_eq!(cloner.handed_off, 2);
        cloner.end_iteration(5).unwrap();
        assert_eq!(cloner.handed_off, 4);
        cloner.end_layer().unwrap();
        assert_eq!(cloner.end_eta_bin().len(), 5);
    }

    #[test]
    fn test_no_proposals_keeps_parents_as_stalled() {
        let config = config(CloneMode::Inline, 3);
        let layer = layer(&config);
        let mut seed = slot(0, 3);
        let parent = seed.candidates[0].clone();
        let stats = materialize(&mut seed, 0, &layer, &config).unwrap();
        assert_eq!(seed.candidates.len(), 1);
        assert!(seed.candidates[0].stalled);
        assert_eq!(seed.candidates[0].hits, parent.hits);
        assert_eq!(stats.backfilled, 1);
        assert_eq!(stats.children, 0);
    }

    #[test]
    fn test_dead_end_takes_free_place() {
        let config = config(CloneMode::Inline, 2);
        let layer = layer(&config);
        let mut seed = slot(0, 2);
        let second = seed.candidates[0].clone();
        seed.candidates.push(second);
        // only the first parent gets a child
        seed.ranking.push(RankKey { n_found: 1, chi2: 0.1 }, hit_proposal(0, 2, 0.1));
        let stats = materialize(&mut seed, 0, &layer, &config).unwrap();
        assert_eq!(stats.children, 1);
        assert_eq!(stats.backfilled, 1);
        assert_eq!(seed.candidates.len(), 2);
        assert!(!seed.candidates[0].stalled);
        assert!(seed.candidates[1].stalled);
    }

    #[test]
    fn test_finished_candidate_outranks_worse_children() {
        let config = config(CloneMode::Inline, 2);
        let layer = layer(&config);
        let mut seed = slot(0, 2);
        let mut finished = seed.candidates[0].clone();
        finished.n_found = 6;
        finished.stalled = true;
        let mut active = seed.candidates[0].clone();
        active.n_found = 3;
        seed.candidates = vec![finished, active];
        for (hit, chi2) in [(1, 0.2), (2, 0.4)] {
            let proposal = Proposal {
                slot: 0,
                parent: 1,
                hit: Some(hit),
                hit_chi2: chi2,
                key: RankKey { n_found: 4, chi2 },
            };
            seed.ranking.push(proposal.key, proposal);
        }

        let stats = materialize(&mut seed, 0, &layer, &config).unwrap();
        let found: Vec<usize> = seed.candidates.iter().map(|c| c.n_found).collect();
        assert_eq!(found, vec![6, 4]);
        assert!(seed.candidates[0].stalled);
        assert_eq!(seed.candidates[1].hits.last().and_then(|h| h.hit), Some(1));
        assert_eq!(stats.proposals, 2);
        assert_eq!(stats.children, 1);
        assert_eq!(stats.backfilled, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn test_drop_joins_worker() {
        let cloner = CandCloner::new(&config(CloneMode::Worker, 2));
        drop(cloner);
    }
}
