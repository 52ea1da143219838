use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::model::NetworkConfig;
use crate::optim::OptimizerConfig;

// =============================================================================
// Training schedule
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Trailing share of episodes kept out of training for evaluation.
    pub held_out_fraction: f64,
    /// Iterations between full held-out evaluation passes.
    pub eval_interval: u64,
    /// Iterations between exported visualization samples.
    pub sample_interval: u64,
    /// Iterations between training-loss log lines.
    pub log_interval: u64,
    /// Iterations between checkpoints.
    pub checkpoint_interval: u64,
    /// Stop after this many iterations; `None` trains until stopped.
    pub max_iterations: Option<u64>,
    pub seed: Option<u64>,
    pub checkpoint_dir: PathBuf,
    pub sample_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            held_out_fraction: 0.05,
            eval_interval: 10_000,
            sample_interval: 100,
            log_interval: 100,
            checkpoint_interval: 10_000,
            max_iterations: None,
            seed: None,
            checkpoint_dir: PathBuf::from("data"),
            sample_dir: PathBuf::from("data/acvp-sample"),
        }
    }
}

// =============================================================================
// Dataset generation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub episodes: usize,
    /// Probability of a uniformly random action instead of the greedy one.
    pub epsilon: f64,
    /// Cut episodes after this many steps; `None` runs to termination.
    pub max_episode_length: Option<usize>,
    /// Action recorded alongside the reset frame.
    pub noop_action: usize,
    pub seed: Option<u64>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            episodes: 1000,
            epsilon: 0.3,
            max_episode_length: None,
            noop_action: 0,
            seed: None,
        }
    }
}

// =============================================================================
// Experiment
// =============================================================================

/// Everything one run needs, threaded from the trainer down to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub game: String,
    /// Root of the episode store; episodes live under `<data_root>/dataset/<game>`.
    pub data_root: PathBuf,
    pub network: NetworkConfig,
    pub optimizer: OptimizerConfig,
    pub train: TrainConfig,
    pub generate: GenerateConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            game: "BreakoutNoFrameskip-v4".to_string(),
            data_root: PathBuf::from("data"),
            network: NetworkConfig::default(),
            optimizer: OptimizerConfig::default(),
            train: TrainConfig::default(),
            generate: GenerateConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.game.is_empty(), "game name is empty");
        ensure!(self.network.history_length > 0, "history_length must be positive");
        ensure!(self.network.latent_dim > 0, "latent_dim must be positive");
        ensure!(self.train.batch_size > 0, "batch_size must be positive");
        ensure!(
            (0.0..1.0).contains(&self.train.held_out_fraction),
            "held_out_fraction must lie in [0, 1)"
        );
        ensure!(
            self.train.eval_interval > 0
                && self.train.sample_interval > 0
                && self.train.log_interval > 0
                && self.train.checkpoint_interval > 0,
            "iteration intervals must be positive"
        );
        ensure!(self.optimizer.learning_rate > 0.0, "learning_rate must be positive");
        ensure!(self.optimizer.grad_clip > 0.0, "grad_clip must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.generate.epsilon),
            "epsilon must lie in [0, 1]"
        );
        Ok(())
    }
}
