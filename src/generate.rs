use anyhow::{Result, bail, ensure};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::GenerateConfig;
use crate::frame::{Frame, FrameStack};
use crate::store::{DatasetMeta, EpisodeStore, MeanAccumulator};
use crate::window::FrameHistory;

/// Outcome of one environment step.
pub struct Step {
    pub observation: Frame,
    pub reward: f32,
    pub done: bool,
}

/// A game that can be rolled out frame by frame.
pub trait Environment {
    fn reset(&mut self) -> Result<Frame>;
    fn step(&mut self, action: usize) -> Result<Step>;
    fn action_count(&self) -> usize;
}

/// Scores every action given the most recent frames, oldest first.
pub trait Policy {
    fn action_values(&mut self, stack: &FrameStack) -> Result<Vec<f32>>;
}

// =============================================================================
// Action selection
// =============================================================================

/// Greedy over action values, uniformly random with probability `epsilon`.
pub struct EpsilonGreedy {
    epsilon: f64,
    rng: SmallRng,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f64, rng: SmallRng) -> Result<Self> {
        ensure!((0.0..=1.0).contains(&epsilon), "epsilon {epsilon} outside [0, 1]");
        Ok(Self { epsilon, rng })
    }

    pub fn select(&mut self, values: &[f32]) -> Result<usize> {
        if values.is_empty() {
            bail!("no action values to select from");
        }
        if self.rng.random::<f64>() < self.epsilon {
            return Ok(self.rng.random_range(0..values.len()));
        }
        let best = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        Ok(best)
    }
}

// =============================================================================
// Dataset generation
// =============================================================================

/// Roll out `config.episodes` episodes and record them through `store`.
///
/// Each episode stores the reset frame paired with `config.noop_action`,
/// then every observation paired with the action that produced it. The mean
/// frame over everything recorded is written as dataset metadata at the end.
pub fn generate_dataset<E, P>(
    env: &mut E,
    policy: &mut P,
    store: &EpisodeStore,
    game: &str,
    config: &GenerateConfig,
    history_length: usize,
) -> Result<DatasetMeta>
where
    E: Environment,
    P: Policy,
{
    let num_actions = env.action_count();
    ensure!(config.episodes > 0, "nothing to generate");
    ensure!(num_actions > 0, "environment has no actions");
    ensure!(
        config.noop_action < num_actions,
        "no-op action {} outside the {num_actions} available",
        config.noop_action
    );

    let rng = match config.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };
    let mut sampler = EpsilonGreedy::new(config.epsilon, rng)?;
    let mut mean = MeanAccumulator::new();

    for ep in 0..config.episodes {
        let first = env.reset()?;
        let mut history = FrameHistory::filled_with(first.clone(), history_length)?;
        let mut frames = vec![first];
        let mut actions = vec![config.noop_action];
        let mut total_reward = 0.0f64;
        let mut steps = 0usize;

        loop {
            if config.max_episode_length.is_some_and(|max| steps >= max) {
                break;
            }
            let values = policy.action_values(&history.stack()?)?;
            ensure!(
                values.len() == num_actions,
                "policy scored {} actions, environment has {num_actions}",
                values.len()
            );
            let action = sampler.select(&values)?;
            let step = env.step(action)?;
            total_reward += step.reward as f64;
            steps += 1;

            history.push(step.observation.clone());
            frames.push(step.observation);
            actions.push(action);
            if step.done {
                break;
            }
        }

        for frame in &frames {
            mean.add(frame)?;
        }
        store.write_episode(game, ep, &frames, &actions)?;
        info!(episode = ep, reward = total_reward, steps, "episode recorded");
    }

    let meta = DatasetMeta {
        episodes: config.episodes,
        num_actions,
        mean_obs: mean.finish()?,
    };
    store.write_metadata(game, &meta)?;
    info!(game, episodes = meta.episodes, frames = mean.count(), "dataset written");
    Ok(meta)
}
