use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use image::{GenericImage, RgbImage};
use std::path::{Path, PathBuf};

use crate::frame::{Frame, tensor_to_frames};
use crate::model::StreamMode;
use crate::normalize::Normalizer;
use crate::predictor::Predictor;
use crate::window::Examples;

const GRID_COLUMNS: usize = 8;
const GRID_PADDING: usize = 2;

/// Tile frames into one image, `GRID_COLUMNS` per row, separated by black
/// padding.
pub fn frame_grid(frames: &[Frame]) -> Result<RgbImage> {
    let first = frames.first().context("no frames to tile")?;
    let (h, w) = first.dims();
    ensure!(
        frames.iter().all(|f| f.dims() == (h, w)),
        "cannot tile frames of different sizes"
    );
    let cols = frames.len().min(GRID_COLUMNS);
    let rows = frames.len().div_ceil(cols);
    let grid_w = cols * (w + GRID_PADDING) + GRID_PADDING;
    let grid_h = rows * (h + GRID_PADDING) + GRID_PADDING;

    let mut grid = RgbImage::new(grid_w as u32, grid_h as u32);
    for (i, frame) in frames.iter().enumerate() {
        let x = GRID_PADDING + (i % cols) * (w + GRID_PADDING);
        let y = GRID_PADDING + (i / cols) * (h + GRID_PADDING);
        grid.copy_from(&frame.to_image()?, x as u32, y as u32)?;
    }
    Ok(grid)
}

pub fn save_grid<P: AsRef<Path>>(frames: &[Frame], path: P) -> Result<()> {
    let path = path.as_ref();
    frame_grid(frames)?
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// One visualization export: prediction, ground truth and, for two-stream
/// networks, the two isolated decodings.
pub struct SampleSet {
    pub predicted: Vec<Frame>,
    pub truth: Vec<Frame>,
    pub isolated: Option<(Vec<Frame>, Vec<Frame>)>,
}

impl SampleSet {
    /// Predict the targets of `examples` and decode back to pixels.
    pub fn render(predictor: &Predictor, normalizer: &Normalizer, examples: &Examples) -> Result<Self> {
        let batch = normalizer.batch(examples, predictor.device())?;
        let to_frames = |t: &Tensor| -> Result<Vec<Frame>> {
            tensor_to_frames(&normalizer.post_process(t)?)
        };

        let predicted = to_frames(&predictor.predict(&batch.x, &batch.a)?)?;
        let isolated = match predictor.streams() {
            StreamMode::TwoStream => {
                let d = predictor.decompose(&batch.x, &batch.a)?;
                Some((to_frames(&d.action)?, to_frames(&d.independent)?))
            }
            StreamMode::Single => None,
        };
        Ok(Self {
            predicted,
            truth: examples.2.clone(),
            isolated,
        })
    }
}

/// Write `<dir>/<iteration>.png`, `<iteration>-truth.png` and, when present,
/// `<iteration>-action.png` / `<iteration>-others.png`. Returns written paths.
pub fn export_samples<P: AsRef<Path>>(dir: P, iteration: u64, set: &SampleSet) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut written = Vec::with_capacity(4);
    let mut save = |suffix: &str, frames: &[Frame]| -> Result<()> {
        let path = dir.join(format!("{iteration}{suffix}.png"));
        save_grid(frames, &path)?;
        written.push(path);
        Ok(())
    };
    save("", &set.predicted)?;
    save("-truth", &set.truth)?;
    if let Some((action, others)) = &set.isolated {
        save("-action", action)?;
        save("-others", others)?;
    }
    Ok(written)
}
