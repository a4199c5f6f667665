//! CombTrack toy simulation CLI
//!
//! Generates toy events, builds tracks and reports efficiency and per-layer
//! branching.

use clap::Parser;
use combtrack_core::{BuildConfig, CloneMode};
use combtrack_sim::{RunSummary, Runner, ToyConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Combinatorial Kalman-filter track building on toy events
#[derive(Parser, Debug)]
#[command(name = "combtrack-sim")]
#[command(about = "Build tracks on simulated events and score them against truth", long_about = None)]
struct Args {
    /// Master seed (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Simulated tracks per event
    #[arg(short, long, default_value = "100")]
    tracks: usize,

    /// Number of events
    #[arg(short, long, default_value = "1")]
    events: usize,

    /// Number of detector layers
    #[arg(long, default_value = "10")]
    layers: usize,

    /// Noise hits added to each layer
    #[arg(long, default_value = "0")]
    noise: usize,

    /// Build config JSON file; command-line options override it
    #[arg(short, long)]
    config: Option<String>,

    /// Candidates kept per seed
    #[arg(short = 'k', long)]
    max_cands: Option<usize>,

    /// Chi2 acceptance cut
    #[arg(long)]
    chi2_cut: Option<f32>,

    /// Producer threads
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Materialize candidates on the producer thread instead of the worker
    #[arg(long)]
    inline: bool,

    /// Also run the single-state reference builder
    #[arg(long)]
    reference: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output on stdout
    #[arg(long)]
    json: bool,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    output: Option<String>,
}

fn build_config(args: &Args) -> Result<BuildConfig, combtrack_sim::SimError> {
    let mut config = match &args.config {
        Some(path) => BuildConfig::from_json_file(path)?,
        None => BuildConfig::default(),
    };
    if let Some(k) = args.max_cands {
        config.max_cands_per_seed = k;
    }
    if let Some(cut) = args.chi2_cut {
        config.chi2_cut = cut;
    }
    if let Some(threads) = args.threads {
        config.producer_threads = threads;
    }
    if args.inline {
        config.clone_mode = CloneMode::Inline;
    }
    Ok(config)
}

fn log_summary(summary: &RunSummary) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "{} events | {} hits | {} seeds | {} candidates",
        summary.events, summary.hits, summary.tracks.seeds, summary.candidates
    );
    info!(
        "efficiency {:.3} ({}/{}) | mean hits {:.2} | mean chi2 {:.2} | {:.1} ms",
        summary.tracks.efficiency,
        summary.tracks.matched,
        summary.tracks.seeds,
        summary.tracks.mean_found_hits,
        summary.tracks.mean_chi2,
        summary.elapsed_ms
    );
    info!("layer  parents  proposals  discarded  children  backfilled  survivors");
    for s in &summary.layer_stats {
        info!(
            "{:>5}  {:>7}  {:>9}  {:>9}  {:>8}  {:>10}  {:>9}",
            s.layer, s.parents, s.proposals, s.discarded, s.children, s.backfilled, s.survivors
        );
    }
    if let Some(reference) = &summary.reference {
        info!(
            "reference: efficiency {:.3} | identical best {}/{} | {:.1} ms",
            reference.summary.efficiency, reference.identical_best, summary.tracks.seeds, reference.elapsed_ms
        );
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let build = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };
    let toy = ToyConfig {
        seed,
        n_tracks: args.tracks,
        n_layers: args.layers,
        b_field: build.b_field,
        layers_per_seed: build.start_layer,
        noise_hits_per_layer: args.noise,
        ..Default::default()
    };

    if !args.json {
        info!("CombTrack toy simulation v0.1.0");
        info!(
            seed,
            tracks = toy.n_tracks,
            layers = toy.n_layers,
            k = build.max_cands_per_seed,
            threads = build.producer_threads,
            mode = ?build.clone_mode,
            "Configuration"
        );
    }

    let summary = Runner::new(build, toy)
        .and_then(|runner| runner.with_events(args.events).with_reference(args.reference).run());
    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            error!("Run failed: {}", e);
            std::process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
    } else {
        log_summary(&summary);
    }

    if let Some(path) = &args.output {
        if let Err(e) = summary.write_json(path) {
            error!("{}", e);
            std::process::exit(1);
        }
        info!("Summary written to {}", path);
    }
}
