#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use acvp::{
    Batcher, CheckpointPaths, EpisodeStore, ExperimentConfig, Normalizer, Predictor, SampleSet,
    StreamMode, TrainMeta, Trainer, export_samples, extend_frames, split_episodes,
};
use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

const RULE: &str = "═══════════════════════════════════════════════════════════";

// =============================================================================
// Section 1: Setup
// =============================================================================

/// CUDA if present, then Metal, else CPU.
fn select_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    Device::new_metal(0).unwrap_or(Device::Cpu)
}

fn load_config(args: &ConfigArgs) -> Result<ExperimentConfig> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(game) = &args.game {
        config.game = game.clone();
    }
    if let Some(root) = &args.data_root {
        config.data_root = root.clone();
    }
    if args.two_stream {
        config.network.streams = StreamMode::TwoStream;
    }
    if let Some(batch_size) = args.batch_size {
        config.train.batch_size = batch_size;
    }
    if let Some(seed) = args.seed {
        config.train.seed = Some(seed);
    }
    config.validate()?;
    Ok(config)
}

/// Raised when a line reading `q` arrives on stdin.
fn stop_on_quit() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line.trim() == "q" {
                flag.store(true, Ordering::Relaxed);
                break;
            }
        }
    });
    stop
}

// =============================================================================
// Section 2: Train
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("{RULE}");
    eprintln!("  TRAINING — action-conditional video prediction (Rust + candle)");
    eprintln!("{RULE}");

    let mut config = load_config(&args.config)?;
    if let Some(iterations) = args.iterations {
        config.train.max_iterations = Some(iterations);
    }
    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);
    eprintln!(
        "Game: {} | Streams: {:?} | Batch: {}",
        config.game, config.network.streams, config.train.batch_size
    );

    let mut trainer = Trainer::new(config, &device)?;
    if let Some(dir) = &args.resume {
        let meta = trainer.resume(dir)?;
        eprintln!(
            "📦 Resumed from {} (iteration={}, epoch={})",
            dir.display(),
            meta.iteration,
            meta.epoch
        );
    }

    eprintln!("Type `q` + Enter to stop and checkpoint.");
    let stop = stop_on_quit();
    let t_start = Instant::now();
    let summary = trainer.run(&stop)?;

    eprintln!(
        "\n✅ Training stopped at iteration {} after {} epochs in {:.1}s",
        summary.iterations,
        summary.epochs,
        t_start.elapsed().as_secs_f64()
    );
    if let Some(loss) = summary.last_loss {
        eprintln!("Last train loss: {loss:.6}");
    }
    if let Some(loss) = summary.best_eval_loss {
        eprintln!("Best test loss:  {loss:.6}");
    }
    Ok(())
}

// =============================================================================
// Section 3: Sample
// =============================================================================

fn sample(args: &SampleArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let device = select_device(args.cpu);
    let store = EpisodeStore::new(&config.data_root);
    let dataset = store.read_metadata(&config.game)?;

    let mut predictor = Predictor::new(&device, &config.network, &config.optimizer, dataset.num_actions)?;
    let paths = CheckpointPaths::new(&config.train.checkpoint_dir, &config.game);
    let checkpoint = args.checkpoint.clone().unwrap_or(paths.model);
    predictor.load(&checkpoint)?;
    let iteration = TrainMeta::load(&paths.meta).map(|m| m.iteration).unwrap_or(0);

    let (_, held_out) = split_episodes(dataset.episodes, config.train.held_out_fraction);
    let episode = match args.episode {
        Some(ep) => ep,
        None if !held_out.is_empty() => held_out.start,
        None => bail!("no held-out episodes; pass --episode"),
    };
    let normalizer = Normalizer::new(&dataset.mean_obs, config.network.history_length, &device)?;
    let ep = store.read_episode(&config.game, episode, dataset.num_actions)?;
    let windowed = extend_frames(&ep.frames, &ep.actions, config.network.history_length)?;
    let mut batcher = Batcher::new(config.train.batch_size, windowed.into_columns())?;
    let examples = batcher
        .next_batch()
        .with_context(|| format!("episode {episode} is too short to sample"))?;

    let set = SampleSet::render(&predictor, &normalizer, &examples)?;
    let dir = args
        .out
        .clone()
        .unwrap_or_else(|| config.train.sample_dir.join(&config.game));
    for path in export_samples(&dir, iteration, &set)? {
        eprintln!("🖼  {}", path.display());
    }
    Ok(())
}

// =============================================================================
// Section 4: Inspect
// =============================================================================

fn inspect(args: &InspectArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let store = EpisodeStore::new(&config.data_root);
    let dataset = store.read_metadata(&config.game)?;
    let (train, held_out) = split_episodes(dataset.episodes, config.train.held_out_fraction);

    eprintln!("{RULE}");
    eprintln!("  DATASET — {}", store.game_dir(&config.game).display());
    eprintln!("{RULE}");
    eprintln!("Episodes: {} (train {}, held-out {})", dataset.episodes, train.len(), held_out.len());
    eprintln!("Actions:  {}", dataset.num_actions);
    eprintln!("Frames:   {}x{}", dataset.mean_obs.height, dataset.mean_obs.width);

    if args.episodes {
        let history = config.network.history_length;
        let mut total = 0usize;
        let mut short = 0usize;
        for ep in 0..dataset.episodes {
            let len = store.episode_len(&config.game, ep)?;
            total += len;
            if len <= history {
                short += 1;
            }
            println!("{ep:05} {len}");
        }
        eprintln!("Recorded frames: {total} | episodes without examples: {short}");
    }
    Ok(())
}

// =============================================================================
// Section 5: CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "acvp", about = "Action-conditional video prediction on game frames")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the predictor on a recorded dataset
    Train(TrainArgs),
    /// Export predictions for one episode from a checkpoint
    Sample(SampleArgs),
    /// Summarize a recorded dataset
    Inspect(InspectArgs),
    /// Print the effective configuration as JSON
    PrintConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON experiment config; missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    game: Option<String>,
    #[arg(long)]
    data_root: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    two_stream: bool,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Parser)]
struct TrainArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Stop after this many iterations
    #[arg(long)]
    iterations: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    /// Checkpoint directory to resume from
    #[arg(long)]
    resume: Option<PathBuf>,
}

#[derive(Parser)]
struct SampleArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Parameters to load; defaults to the game's checkpoint
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Episode to sample; defaults to the first held-out one
    #[arg(long)]
    episode: Option<usize>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct InspectArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// List every episode's length
    #[arg(long, default_value_t = false)]
    episodes: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Sample(args) => sample(args),
        Commands::Inspect(args) => inspect(args),
        Commands::PrintConfig(args) => {
            let config = load_config(args)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
