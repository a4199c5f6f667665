//! End-to-end build scenarios across clone modes, producer counts and the
//! single-state reference path.

use combtrack_core::kalman::transport_to_radius;
use combtrack_core::{BuildConfig, CloneMode, Event, Hit, Layer, Seed, TrackBuilder, TrackState};
use nalgebra::{Matrix3, Matrix6, Vector3, Vector6};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn hit_cov() -> Matrix3<f32> {
    Matrix3::from_diagonal(&Vector3::new(1e-4, 1e-4, 1e-2))
}

fn seed_cov(momentum: &Vector3<f32>) -> Matrix6<f32> {
    let mut diag = Vector6::new(1e-4, 1e-4, 1e-2, 0.0, 0.0, 0.0);
    for i in 0..3 {
        diag[3 + i] = (0.01 * momentum[i]).powi(2) + 1e-6;
    }
    Matrix6::from_diagonal(&diag)
}

/// Tracks from the origin with hits on `n_layers` layers at 4 cm spacing,
/// plus uniformly scattered noise hits.
fn random_event(seed: u64, n_tracks: usize, n_layers: usize, noise_per_layer: usize, config: &BuildConfig) -> Event {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let radii: Vec<f32> = (0..n_layers).map(|i| 4.0 * (i + 1) as f32).collect();
    let mut layers: Vec<Layer> = radii.iter().map(|&radius| Layer { radius, hits: Vec::new() }).collect();
    let mut seeds = Vec::new();

    for track in 0..n_tracks {
        let pt: f32 = rng.gen_range(1.0..5.0);
        let phi: f32 = rng.gen_range(-3.1..3.1);
        let momentum = Vector3::new(pt * phi.cos(), pt * phi.sin(), pt * rng.gen_range(-0.8..0.8));
        let charge = if rng.gen_bool(0.5) { 1 } else { -1 };
        let mut params = [0.0, 0.0, 0.0, momentum.x, momentum.y, momentum.z];
        for (layer, &radius) in layers.iter_mut().zip(&radii) {
            let Some(t) = transport_to_radius(&params, charge, config.kappa(), radius) else {
                break;
            };
            params = t.params;
            let smear = Vector3::new(rng.gen_range(-0.005..0.005), rng.gen_range(-0.005..0.005), rng.gen_range(-0.05..0.05));
            let position = Vector3::new(params[0], params[1], params[2]) + smear;
            layer.hits.push(Hit::new(position, hit_cov()).with_mc_track(track as u32));
        }
        seeds.push(Seed {
            state: TrackState::new(Vector3::zeros(), momentum, seed_cov(&momentum), charge),
            hits: Vec::new(),
            mc_track_id: Some(track as u32),
        });
    }

    for layer in layers.iter_mut() {
        for _ in 0..noise_per_layer {
            let phi: f32 = rng.gen_range(-3.14..3.14);
            let z: f32 = rng.gen_range(-1.0..1.0) * layer.radius;
            let position = Vector3::new(layer.radius * phi.cos(), layer.radius * phi.sin(), z);
            layer.hits.push(Hit::new(position, hit_cov()));
        }
    }
    Event { layers, seeds }
}

fn base_config() -> BuildConfig {
    BuildConfig {
        start_layer: 0,
        max_cands_per_seed: 4,
        ..Default::default()
    }
}

#[test]
fn test_exact_helix_is_found_on_every_layer() {
    let config = base_config();
    let momentum = Vector3::new(1.5f32, 0.8, 0.4);
    let mut params = [0.0, 0.0, 0.0, momentum.x, momentum.y, momentum.z];
    let mut layers = Vec::new();
    for i in 0..6 {
        let radius = 4.0 * (i + 1) as f32;
        let t = transport_to_radius(&params, -1, config.kappa(), radius).unwrap();
        params = t.params;
        layers.push(Layer {
            radius,
            hits: vec![Hit::new(Vector3::new(params[0], params[1], params[2]), hit_cov())],
        });
    }
    let event = Event {
        layers,
        seeds: vec![Seed {
            state: TrackState::new(Vector3::zeros(), momentum, seed_cov(&momentum), -1),
            hits: Vec::new(),
            mc_track_id: None,
        }],
    };

    let result = TrackBuilder::new(config).unwrap().build(&event).unwrap();
    let best = result.best(0).unwrap();
    assert_eq!(result.tracks[0].candidates.len(), 1);
    assert_eq!(best.n_found, 6);
    assert!(best.chi2 < 1e-2, "chi2 = {}", best.chi2);
    assert_eq!(best.found_hits().collect::<Vec<_>>(), (0..6).map(|l| (l, 0)).collect::<Vec<_>>());
}

#[test]
fn test_tied_hits_keep_the_earlier_one() {
    let config = BuildConfig {
        b_field: 0.0,
        max_cands_per_seed: 1,
        ..base_config()
    };
    let layers = [5.0f32, 10.0]
        .iter()
        .map(|&r| Layer {
            radius: r,
            hits: vec![Hit::new(Vector3::new(r, 0.0, 0.0), hit_cov()); 2],
        })
        .collect();
    let momentum = Vector3::new(1.0, 0.0, 0.0);
    let event = Event {
        layers,
        seeds: vec![Seed {
            state: TrackState::new(Vector3::zeros(), momentum, seed_cov(&momentum), 1),
            hits: Vec::new(),
            mc_track_id: None,
        }],
    };

    let builder = TrackBuilder::new(config).unwrap();
    let built = builder.build(&event).unwrap();
    let reference = builder.build_reference(&event).unwrap();
    assert_eq!(built.layer_stats, reference.layer_stats);
    assert_eq!(built.layer_stats[0].discarded, 1);
    for result in [built, reference] {
        assert_eq!(result.tracks[0].candidates.len(), 1);
        let best = result.best(0).unwrap();
        assert_eq!(best.found_hits().collect::<Vec<_>>(), vec![(0, 0), (1, 0)]);
    }
}

#[test]
fn test_gap_is_bridged_then_track_stops() {
    let config = BuildConfig {
        b_field: 0.0,
        ..base_config()
    };
    // hits on the track at layers 0, 2 and 5; layers 1, 3 and 4 only hold a hit a quarter turn away
    let layers = (0..6)
        .map(|i| {
            let r = 4.0 * (i + 1) as f32;
            let position = if [0, 2, 5].contains(&i) {
                Vector3::new(r, 0.0, 0.0)
            } else {
                Vector3::new(0.0, r, 0.0)
            };
            Layer {
                radius: r,
                hits: vec![Hit::new(position, hit_cov())],
            }
        })
        .collect();
    let momentum = Vector3::new(1.0, 0.0, 0.0);
    let event = Event {
        layers,
        seeds: vec![Seed {
            state: TrackState::new(Vector3::zeros(), momentum, seed_cov(&momentum), 1),
            hits: Vec::new(),
            mc_track_id: None,
        }],
    };

    let builder = TrackBuilder::new(config).unwrap();
    let built = builder.build(&event).unwrap();
    let reference = builder.build_reference(&event).unwrap();
    assert_eq!(built.layer_stats, reference.layer_stats);
    assert_eq!(built.layer_stats[4].backfilled, 1);
    assert_eq!(built.layer_stats[4].proposals, 0);
    for result in [built, reference] {
        assert_eq!(result.tracks[0].candidates.len(), 1);
        let best = result.best(0).unwrap();
        let hits: Vec<(usize, Option<u32>)> = best.hits.iter().map(|h| (h.layer, h.hit)).collect();
        // one gap is bridged; the second consecutive gap ends the track before layer 5
        assert_eq!(hits, vec![(0, Some(0)), (1, None), (2, Some(0)), (3, None)]);
        assert_eq!(best.n_found, 2);
        assert_eq!(best.consecutive_misses, 1);
        assert!(best.stalled);
        assert!(best.chi2 < 1e-3);
    }
}

#[test]
fn test_modes_and_thread_counts_agree() {
    let config = base_config();
    let event = random_event(7, 40, 8, 30, &config);

    let worker = TrackBuilder::new(config.clone()).unwrap().build(&event).unwrap();
    let inline = TrackBuilder::new(BuildConfig { clone_mode: CloneMode::Inline, ..config.clone() })
        .unwrap()
        .build(&event)
        .unwrap();
    let threaded = TrackBuilder::new(BuildConfig { producer_threads: 3, ..config.clone() })
        .unwrap()
        .build(&event)
        .unwrap();

    assert_eq!(worker, inline);
    assert_eq!(worker, threaded);
}

#[test]
fn test_candidate_sets_stay_bounded() {
    let config = BuildConfig {
        max_cands_per_seed: 3,
        max_consecutive_misses: 2,
        ..base_config()
    };
    let event = random_event(11, 25, 8, 200, &config);
    let result = TrackBuilder::new(config.clone()).unwrap().build(&event).unwrap();

    for tracks in &result.tracks {
        assert!(tracks.candidates.len() <= 3);
        for pair in tracks.candidates.windows(2) {
            assert_ne!(pair[0].rank_key().cmp_rank(&pair[1].rank_key()), std::cmp::Ordering::Greater);
        }
        for cand in &tracks.candidates {
            assert!(cand.consecutive_misses <= 2);
        }
    }
    for stats in &result.layer_stats {
        assert_eq!(stats.seeds, 25);
        assert!(stats.survivors <= 3 * 25);
        assert_eq!(stats.children + stats.discarded, stats.proposals);
    }
}

#[test]
fn test_batched_engine_tracks_reference() {
    let config = base_config();
    let event = random_event(3, 30, 8, 10, &config);
    let builder = TrackBuilder::new(config).unwrap();
    let engine = builder.build(&event).unwrap();
    let reference = builder.build_reference(&event).unwrap();

    let agreeing = engine
        .tracks
        .iter()
        .zip(&reference.tracks)
        .filter(|(a, b)| a.best.as_ref().map(|c| c.n_found) == b.best.as_ref().map(|c| c.n_found))
        .count();
    assert!(agreeing * 10 >= engine.tracks.len() * 9, "only {} of {} agree", agreeing, engine.tracks.len());
}

#[test]
fn test_most_tracks_are_found() {
    let config = base_config();
    let event = random_event(5, 30, 8, 10, &config);
    let result = TrackBuilder::new(config).unwrap().build(&event).unwrap();

    let complete = result
        .tracks
        .iter()
        .filter_map(|t| t.best.as_ref())
        .filter(|best| best.n_found >= 7)
        .count();
    assert!(complete * 10 >= 30 * 8, "only {} complete tracks", complete);
}
