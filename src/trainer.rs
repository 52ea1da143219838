use anyhow::{Context, Result, bail, ensure};
use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::{IndexedRandom, SliceRandom};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::batcher::Batcher;
use crate::config::ExperimentConfig;
use crate::eval::{evaluate_held_out, first_held_out_batch};
use crate::normalize::Normalizer;
use crate::predictor::Predictor;
use crate::store::{DatasetMeta, EpisodeStore};
use crate::visualize::{SampleSet, export_samples};
use crate::window::{Examples, extend_frames};

const CHECKPOINT_PREFIX: &str = "acvp";

/// Progress record written next to each checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMeta {
    pub iteration: u64,
    pub epoch: u64,
    pub best_eval_loss: Option<f32>,
}

impl TrainMeta {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Missing training record {}", path.display()))?;
        let meta = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Corrupt training record {}", path.display()))?;
        Ok(meta)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub iterations: u64,
    pub epochs: u64,
    pub last_loss: Option<f32>,
    pub best_eval_loss: Option<f32>,
}

/// File names of one game's checkpoint inside a directory.
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub optimizer: PathBuf,
    pub meta: PathBuf,
    pub best: PathBuf,
}

impl CheckpointPaths {
    pub fn new<P: AsRef<Path>>(dir: P, game: &str) -> Self {
        let dir = dir.as_ref();
        let stem = format!("{CHECKPOINT_PREFIX}-{game}");
        Self {
            model: dir.join(format!("{stem}.safetensors")),
            optimizer: dir.join(format!("{stem}.optimizer.safetensors")),
            meta: dir.join(format!("{stem}.meta.json")),
            best: dir.join(format!("{stem}-best.safetensors")),
        }
    }
}

/// Split `episodes` into a leading training range and a trailing held-out one.
pub fn split_episodes(episodes: usize, held_out_fraction: f64) -> (Range<usize>, Range<usize>) {
    let train = ((episodes as f64) * (1.0 - held_out_fraction)).floor() as usize;
    let train = train.min(episodes);
    (0..train, train..episodes)
}

// =============================================================================
// Trainer
// =============================================================================

pub struct Trainer {
    config: ExperimentConfig,
    store: EpisodeStore,
    dataset: DatasetMeta,
    normalizer: Normalizer,
    predictor: Predictor,
    rng: SmallRng,
    iteration: u64,
    epoch: u64,
    best_eval_loss: Option<f32>,
    last_loss: Option<f32>,
    sample: Option<Examples>,
}

impl Trainer {
    pub fn new(config: ExperimentConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let store = EpisodeStore::new(&config.data_root);
        let dataset = store.read_metadata(&config.game)?;
        let frame = (config.network.frame_height, config.network.frame_width);
        ensure!(
            dataset.mean_obs.dims() == frame,
            "dataset frames are {:?} but the network expects {:?}",
            dataset.mean_obs.dims(),
            frame
        );
        ensure!(dataset.num_actions > 0, "dataset records no actions");

        let normalizer = Normalizer::new(&dataset.mean_obs, config.network.history_length, device)?;
        let predictor = Predictor::new(device, &config.network, &config.optimizer, dataset.num_actions)?;
        let rng = match config.train.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        Ok(Self {
            config,
            store,
            dataset,
            normalizer,
            predictor,
            rng,
            iteration: 0,
            epoch: 0,
            best_eval_loss: None,
            last_loss: None,
            sample: None,
        })
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn dataset(&self) -> &DatasetMeta {
        &self.dataset
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    fn checkpoint_paths(&self) -> CheckpointPaths {
        CheckpointPaths::new(&self.config.train.checkpoint_dir, &self.config.game)
    }

    /// Restore parameters, optimizer moments and progress from `dir`.
    pub fn resume<P: AsRef<Path>>(&mut self, dir: P) -> Result<TrainMeta> {
        let paths = CheckpointPaths::new(dir.as_ref(), &self.config.game);
        self.predictor.load(&paths.model)?;
        if let Err(err) = self.predictor.load_optimizer(&paths.optimizer) {
            warn!(error = %err, "optimizer state not restored, starting with fresh moments");
        }
        let meta = TrainMeta::load(&paths.meta)?;
        self.iteration = meta.iteration;
        self.epoch = meta.epoch;
        self.best_eval_loss = meta.best_eval_loss;
        info!(
            dir = %dir.as_ref().display(),
            iteration = meta.iteration,
            epoch = meta.epoch,
            "resumed"
        );
        Ok(meta)
    }

    pub fn save_checkpoint(&self) -> Result<()> {
        let dir = &self.config.train.checkpoint_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let paths = self.checkpoint_paths();
        self.predictor.save(&paths.model)?;
        self.predictor.save_optimizer(&paths.optimizer)?;

        TrainMeta {
            iteration: self.iteration,
            epoch: self.epoch,
            best_eval_loss: self.best_eval_loss,
        }
        .save(&paths.meta)
    }

    fn should_stop(&self, stop: &AtomicBool) -> bool {
        stop.load(Ordering::Relaxed)
            || self
                .config
                .train
                .max_iterations
                .is_some_and(|max| self.iteration >= max)
    }

    /// Train until `stop` is raised or the iteration budget runs out, then
    /// write a final checkpoint.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<TrainSummary> {
        let (train_range, _) = self.split();
        ensure!(!train_range.is_empty(), "no training episodes for {}", self.config.game);
        info!(
            game = %self.config.game,
            episodes = self.dataset.episodes,
            training = train_range.len(),
            streams = ?self.predictor.streams(),
            "training"
        );

        let started = Instant::now();
        let start_iteration = self.iteration;
        'train: loop {
            let mut order: Vec<usize> = train_range.clone().collect();
            order.shuffle(&mut self.rng);
            let mut trained = 0usize;

            for ep in order {
                if self.should_stop(stop) {
                    break 'train;
                }
                let episode = self
                    .store
                    .read_episode(&self.config.game, ep, self.dataset.num_actions)?;
                let windowed =
                    extend_frames(&episode.frames, &episode.actions, self.config.network.history_length)?;
                if windowed.is_empty() {
                    debug!(episode = ep, frames = episode.frames.len(), "skipping short episode");
                    continue;
                }

                let mut batcher = Batcher::new(self.config.train.batch_size, windowed.into_columns())?;
                batcher.shuffle(&mut self.rng);
                while let Some(examples) = batcher.next_batch() {
                    if self.should_stop(stop) {
                        break 'train;
                    }
                    self.periodic()?;

                    let batch = self.normalizer.batch(&examples, self.predictor.device())?;
                    let loss = self.predictor.fit(&batch.x, &batch.a, &batch.y)?;
                    ensure!(loss.is_finite(), "training loss diverged at iteration {}", self.iteration);
                    if self.iteration % self.config.train.log_interval == 0 {
                        info!(iteration = self.iteration, loss, "train");
                    }
                    self.last_loss = Some(loss);
                    self.iteration += 1;
                    trained += 1;
                }
            }

            if trained == 0 {
                bail!(
                    "epoch {} trained no batches: every training episode of {} is shorter than {} frames",
                    self.epoch,
                    self.config.game,
                    self.config.network.history_length + 1
                );
            }
            self.epoch += 1;
            debug!(epoch = self.epoch, iteration = self.iteration, "epoch done");
        }

        self.save_checkpoint()?;
        let done = self.iteration - start_iteration;
        info!(
            iterations = done,
            secs = started.elapsed().as_secs_f64(),
            "training stopped"
        );
        Ok(TrainSummary {
            iterations: self.iteration,
            epochs: self.epoch,
            last_loss: self.last_loss,
            best_eval_loss: self.best_eval_loss,
        })
    }

    fn split(&self) -> (Range<usize>, Range<usize>) {
        split_episodes(self.dataset.episodes, self.config.train.held_out_fraction)
    }

    /// Evaluation, sample export and checkpointing, run before the update of
    /// each iteration.
    fn periodic(&mut self) -> Result<()> {
        let it = self.iteration;
        if it % self.config.train.eval_interval == 0 {
            self.evaluate()?;
        }
        if it % self.config.train.sample_interval == 0 {
            self.export_sample()?;
        }
        if it > 0 && it % self.config.train.checkpoint_interval == 0 {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    fn evaluate(&mut self) -> Result<()> {
        let (_, held_out) = self.split();
        if held_out.is_empty() {
            warn!(iteration = self.iteration, "no held-out episodes, skipping evaluation");
            return Ok(());
        }
        let candidates: Vec<usize> = held_out.clone().collect();
        let sample_episode = candidates.choose(&mut self.rng).copied();
        let stats = evaluate_held_out(
            &self.predictor,
            &self.store,
            &self.normalizer,
            &self.config.game,
            held_out,
            self.config.train.batch_size,
            sample_episode,
        )?;
        if stats.sample.is_some() {
            self.sample = stats.sample;
        }

        let Some(loss) = stats.mean_loss else {
            warn!(
                iteration = self.iteration,
                skipped = stats.skipped,
                "every held-out episode is too short to evaluate"
            );
            return Ok(());
        };
        info!(
            iteration = self.iteration,
            loss,
            batches = stats.batches,
            episodes = stats.episodes,
            "test"
        );
        if self.best_eval_loss.is_none_or(|best| loss < best) {
            self.best_eval_loss = Some(loss);
            let dir = &self.config.train.checkpoint_dir;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            self.predictor.save(self.checkpoint_paths().best)?;
        }
        Ok(())
    }

    /// Renders the cached held-out batch. After a resume the cache may be
    /// empty until the next evaluation, so it is filled from the first usable
    /// held-out episode.
    fn export_sample(&mut self) -> Result<()> {
        if self.sample.is_none() {
            let (_, held_out) = self.split();
            self.sample = first_held_out_batch(
                &self.store,
                &self.config.game,
                held_out,
                self.config.network.history_length,
                self.dataset.num_actions,
                self.config.train.batch_size,
            )?;
        }
        let Some(examples) = &self.sample else {
            debug!(iteration = self.iteration, "no held-out batch to sample");
            return Ok(());
        };
        let set = SampleSet::render(&self.predictor, &self.normalizer, examples)?;
        let dir = self.config.train.sample_dir.join(&self.config.game);
        let written = export_samples(&dir, self.iteration, &set)?;
        debug!(iteration = self.iteration, files = written.len(), "samples written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_out_is_the_trailing_share() {
        assert_eq!(split_episodes(1000, 0.05), (0..950, 950..1000));
        assert_eq!(split_episodes(3, 0.34), (0..1, 1..3));
        assert_eq!(split_episodes(10, 0.0), (0..10, 10..10));
        assert_eq!(split_episodes(0, 0.05), (0..0, 0..0));
    }

    #[test]
    fn checkpoint_names_are_keyed_by_game() {
        let paths = CheckpointPaths::new("data", "PongNoFrameskip-v4");
        assert_eq!(paths.model, Path::new("data/acvp-PongNoFrameskip-v4.safetensors"));
        assert_eq!(
            paths.optimizer,
            Path::new("data/acvp-PongNoFrameskip-v4.optimizer.safetensors")
        );
        assert_eq!(paths.meta, Path::new("data/acvp-PongNoFrameskip-v4.meta.json"));
        assert_eq!(paths.best, Path::new("data/acvp-PongNoFrameskip-v4-best.safetensors"));
    }
}
