use anyhow::{Result, ensure};
use std::ops::Range;
use tracing::debug;

use crate::batcher::Batcher;
use crate::normalize::Normalizer;
use crate::predictor::Predictor;
use crate::store::EpisodeStore;
use crate::window::{Examples, extend_frames};

pub struct EvalStats {
    /// Mean of per-batch losses; `None` when no batch was evaluated.
    pub mean_loss: Option<f32>,
    pub batches: usize,
    pub episodes: usize,
    /// Held-out episodes too short to yield an example.
    pub skipped: usize,
    /// First batch of the sample episode, kept for visualization.
    pub sample: Option<Examples>,
}

/// One full pass over held-out episodes, in order, without shuffling.
///
/// `sample_episode` picks which episode's first batch is returned in
/// `EvalStats::sample`; if it yields nothing, the first usable episode's
/// first batch is kept instead.
pub fn evaluate_held_out(
    predictor: &Predictor,
    store: &EpisodeStore,
    normalizer: &Normalizer,
    game: &str,
    episodes: Range<usize>,
    batch_size: usize,
    sample_episode: Option<usize>,
) -> Result<EvalStats> {
    ensure!(batch_size > 0, "batch size must be positive");
    let history = normalizer.history_length();
    let num_actions = predictor.num_actions();

    let mut total_loss = 0.0f64;
    let mut batches = 0usize;
    let mut evaluated = 0usize;
    let mut skipped = 0usize;
    let mut sample: Option<Examples> = None;
    let mut fallback: Option<Examples> = None;

    for ep in episodes {
        let episode = store.read_episode(game, ep, num_actions)?;
        let windowed = extend_frames(&episode.frames, &episode.actions, history)?;
        if windowed.is_empty() {
            debug!(episode = ep, frames = episode.frames.len(), "held-out episode too short");
            skipped += 1;
            continue;
        }
        evaluated += 1;

        let mut batcher = Batcher::new(batch_size, windowed.into_columns())?;
        let mut first = true;
        while let Some(examples) = batcher.next_batch() {
            let batch = normalizer.batch(&examples, predictor.device())?;
            total_loss += predictor.evaluate(&batch.x, &batch.a, &batch.y)? as f64;
            batches += 1;
            if first {
                if sample_episode == Some(ep) {
                    sample = Some(examples);
                } else if fallback.is_none() {
                    fallback = Some(examples);
                }
                first = false;
            }
        }
    }

    let mean_loss = (batches > 0).then(|| (total_loss / batches as f64) as f32);
    Ok(EvalStats {
        mean_loss,
        batches,
        episodes: evaluated,
        skipped,
        sample: sample.or(fallback),
    })
}

/// First batch of the first held-out episode long enough to yield examples.
pub fn first_held_out_batch(
    store: &EpisodeStore,
    game: &str,
    episodes: Range<usize>,
    history: usize,
    num_actions: usize,
    batch_size: usize,
) -> Result<Option<Examples>> {
    ensure!(batch_size > 0, "batch size must be positive");
    for ep in episodes {
        let episode = store.read_episode(game, ep, num_actions)?;
        let windowed = extend_frames(&episode.frames, &episode.actions, history)?;
        if windowed.is_empty() {
            continue;
        }
        let mut batcher = Batcher::new(batch_size, windowed.into_columns())?;
        return Ok(batcher.next_batch());
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::model::StreamMode;
    use crate::model::tests::tiny_config;
    use crate::optim::OptimizerConfig;
    use crate::store::MeanFrame;
    use candle_core::Device;

    const H: usize = 50;
    const W: usize = 48;
    const GAME: &str = "Test";

    fn write_episode(store: &EpisodeStore, ep: usize, len: usize) {
        let frames: Vec<Frame> = (0..len)
            .map(|i| Frame::filled(H, W, [(i * 10) as u8, ep as u8, 0]))
            .collect();
        let actions: Vec<usize> = (0..len).map(|i| i % 3).collect();
        store.write_episode(GAME, ep, &frames, &actions).unwrap();
    }

    fn setup(dir: &std::path::Path) -> (EpisodeStore, Normalizer, Predictor) {
        let store = EpisodeStore::new(dir);
        // usable, too short, usable
        write_episode(&store, 0, 7);
        write_episode(&store, 1, 4);
        write_episode(&store, 2, 9);
        let mean = MeanFrame {
            height: H,
            width: W,
            values: vec![0.0; 3 * H * W],
        };
        let normalizer = Normalizer::new(&mean, 4, &Device::Cpu).unwrap();
        let predictor = Predictor::new(
            &Device::Cpu,
            &tiny_config(H, W, StreamMode::Single),
            &OptimizerConfig::default(),
            3,
        )
        .unwrap();
        (store, normalizer, predictor)
    }

    #[test]
    fn skips_short_episodes_and_keeps_requested_sample() {
        let dir = tempfile::tempdir().unwrap();
        let (store, norm, p) = setup(dir.path());
        let stats = evaluate_held_out(&p, &store, &norm, GAME, 0..3, 2, Some(2)).unwrap();
        assert_eq!(stats.episodes, 2);
        assert_eq!(stats.skipped, 1);
        // 3 examples -> 2 batches, 5 examples -> 3 batches
        assert_eq!(stats.batches, 5);
        assert!(stats.mean_loss.unwrap().is_finite());

        let (stacks, actions, targets) = stats.sample.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(stacks.len(), 2);
        assert_eq!(actions.len(), 2);
        assert_eq!(targets[0].pixel(0, 0), [40, 2, 0]);
    }

    #[test]
    fn unusable_sample_episode_falls_back_to_first_usable() {
        let dir = tempfile::tempdir().unwrap();
        let (store, norm, p) = setup(dir.path());
        let stats = evaluate_held_out(&p, &store, &norm, GAME, 0..3, 2, Some(1)).unwrap();
        let (_, _, targets) = stats.sample.unwrap();
        assert_eq!(targets[0].pixel(0, 0), [40, 0, 0]);
    }

    #[test]
    fn nothing_to_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let (store, norm, p) = setup(dir.path());
        let stats = evaluate_held_out(&p, &store, &norm, GAME, 1..2, 2, None).unwrap();
        assert!(stats.mean_loss.is_none());
        assert_eq!(stats.batches, 0);
        assert_eq!(stats.skipped, 1);
        assert!(stats.sample.is_none());

        let stats = evaluate_held_out(&p, &store, &norm, GAME, 3..3, 2, None).unwrap();
        assert_eq!(stats.episodes, 0);
    }

    #[test]
    fn first_batch_skips_short_episodes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _, _) = setup(dir.path());
        let (_, _, targets) = first_held_out_batch(&store, GAME, 1..3, 4, 3, 2)
            .unwrap()
            .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].pixel(0, 0), [40, 2, 0]);
        assert!(first_held_out_batch(&store, GAME, 1..2, 4, 3, 2).unwrap().is_none());
    }
}
