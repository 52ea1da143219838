use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::frame::{CHANNELS, Frame, OneHot};

const ACTION_FILE: &str = "action.bin";
const META_FILE: &str = "meta.bin";

/// Per-pixel mean observation, channel-first (3, H, W).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanFrame {
    pub height: usize,
    pub width: usize,
    pub values: Vec<f32>,
}

impl MeanFrame {
    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Corpus-level statistics written once after dataset generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub episodes: usize,
    pub num_actions: usize,
    pub mean_obs: MeanFrame,
}

/// One episode as read back for training: N frames, N-1 actions.
#[derive(Debug, Clone)]
pub struct Episode {
    pub frames: Vec<Frame>,
    pub actions: Vec<OneHot>,
}

// =============================================================================
// Episode Store
// =============================================================================

/// On-disk dataset: `<root>/dataset/<game>/<episode:05>/<frame:05>.png`
/// plus one `action.bin` per episode and one `meta.bin` per game.
#[derive(Debug, Clone)]
pub struct EpisodeStore {
    root: PathBuf,
}

impl EpisodeStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn game_dir(&self, game: &str) -> PathBuf {
        self.root.join("dataset").join(game)
    }

    pub fn episode_dir(&self, game: &str, index: usize) -> PathBuf {
        self.game_dir(game).join(format!("{index:05}"))
    }

    /// Persist one episode. `actions[i]` is the action recorded with
    /// `frames[i]`; the first one is the no-op of the reset step.
    pub fn write_episode(
        &self,
        game: &str,
        index: usize,
        frames: &[Frame],
        actions: &[usize],
    ) -> Result<()> {
        ensure!(
            frames.len() == actions.len(),
            "episode {index}: {} frames but {} actions",
            frames.len(),
            actions.len()
        );
        let dir = self.episode_dir(game, index);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let actions: Vec<u32> = actions.iter().map(|&a| a as u32).collect();
        let file = File::create(dir.join(ACTION_FILE))?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, &actions)?;

        for (i, frame) in frames.iter().enumerate() {
            let path = dir.join(format!("{:05}.png", i + 1));
            frame
                .to_image()?
                .save(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }

    fn read_actions(&self, game: &str, index: usize) -> Result<Vec<u32>> {
        let path = self.episode_dir(game, index).join(ACTION_FILE);
        let file = File::open(&path)
            .with_context(|| format!("Missing action file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let actions: Vec<u32> = bincode::deserialize_from(reader)
            .with_context(|| format!("Corrupt action file {}", path.display()))?;
        Ok(actions)
    }

    /// Number of recorded steps (frames) of an episode.
    pub fn episode_len(&self, game: &str, index: usize) -> Result<usize> {
        Ok(self.read_actions(game, index)?.len())
    }

    /// Read an episode back, dropping the reset no-op so that `actions[i]`
    /// moves `frames[i]` to `frames[i + 1]`.
    pub fn read_episode(&self, game: &str, index: usize, num_actions: usize) -> Result<Episode> {
        let dir = self.episode_dir(game, index);
        let raw = self.read_actions(game, index)?;

        let mut frames = Vec::with_capacity(raw.len());
        for i in 1..=raw.len() {
            let path = dir.join(format!("{i:05}.png"));
            let image = image::open(&path)
                .with_context(|| format!("Failed to read frame {}", path.display()))?
                .to_rgb8();
            frames.push(Frame::from_image(image));
        }
        if let Some(first) = frames.first() {
            let dims = first.dims();
            ensure!(
                frames.iter().all(|f| f.dims() == dims),
                "episode {index} of {game} mixes frame sizes"
            );
        }

        let actions = raw
            .iter()
            .skip(1)
            .map(|&a| OneHot::new(a as usize, num_actions))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("episode {index} of {game}"))?;
        Ok(Episode { frames, actions })
    }

    pub fn write_metadata(&self, game: &str, meta: &DatasetMeta) -> Result<()> {
        ensure!(
            meta.mean_obs.values.len() == CHANNELS * meta.mean_obs.height * meta.mean_obs.width,
            "mean frame does not match its dimensions"
        );
        let dir = self.game_dir(game);
        std::fs::create_dir_all(&dir)?;
        let file = File::create(dir.join(META_FILE))?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, meta)?;
        Ok(())
    }

    pub fn read_metadata(&self, game: &str) -> Result<DatasetMeta> {
        let path = self.game_dir(game).join(META_FILE);
        let file = File::open(&path)
            .with_context(|| format!("Missing dataset metadata {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let meta = bincode::deserialize_from(reader)
            .with_context(|| format!("Corrupt dataset metadata {}", path.display()))?;
        Ok(meta)
    }
}

// =============================================================================
// Mean accumulation
// =============================================================================

/// Running per-pixel sum over every saved frame of a dataset.
#[derive(Debug, Clone, Default)]
pub struct MeanAccumulator {
    dims: Option<(usize, usize)>,
    sum: Vec<f64>,
    count: u64,
}

impl MeanAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, frame: &Frame) -> Result<()> {
        match self.dims {
            None => {
                self.dims = Some(frame.dims());
                self.sum = vec![0.0; frame.pixels().len()];
            }
            Some(dims) => ensure!(
                dims == frame.dims(),
                "frame size {:?} differs from dataset frame size {:?}",
                frame.dims(),
                dims
            ),
        }
        for (s, &p) in self.sum.iter_mut().zip(frame.pixels()) {
            *s += p as f64;
        }
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean frame in channel-first layout.
    pub fn finish(&self) -> Result<MeanFrame> {
        let (height, width) = self.dims.context("no frames were accumulated")?;
        let n = self.count as f64;
        let mut values = vec![0.0f32; self.sum.len()];
        for y in 0..height {
            for x in 0..width {
                for c in 0..CHANNELS {
                    let hwc = (y * width + x) * CHANNELS + c;
                    let chw = (c * height + y) * width + x;
                    values[chw] = (self.sum[hwc] / n) as f32;
                }
            }
        }
        Ok(MeanFrame {
            height,
            width,
            values,
        })
    }
}
