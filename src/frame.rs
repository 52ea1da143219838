use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use image::RgbImage;
use std::sync::Arc;

/// Number of color channels in a raw frame.
pub const CHANNELS: usize = 3;

// =============================================================================
// Frame
// =============================================================================

/// One RGB observation, stored height × width × channel.
///
/// The pixel buffer is shared, so cloning a frame is cheap and windowed
/// examples can point at the episode's frames instead of copying them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    height: usize,
    width: usize,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(height: usize, width: usize, pixels: Vec<u8>) -> Result<Self> {
        ensure!(
            pixels.len() == height * width * CHANNELS,
            "frame buffer holds {} bytes, expected {height}x{width}x{CHANNELS}",
            pixels.len()
        );
        Ok(Self {
            height,
            width,
            pixels: pixels.into(),
        })
    }

    /// Uniformly colored frame.
    pub fn filled(height: usize, width: usize, rgb: [u8; 3]) -> Self {
        let pixels: Vec<u8> = rgb
            .iter()
            .copied()
            .cycle()
            .take(height * width * CHANNELS)
            .collect();
        Self {
            height,
            width,
            pixels: pixels.into(),
        }
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            height: height as usize,
            width: width as usize,
            pixels: image.into_raw().into(),
        }
    }

    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width as u32, self.height as u32, self.pixels.to_vec())
            .context("frame buffer does not match its dimensions")
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, y: usize, x: usize) -> [u8; 3] {
        let i = (y * self.width + x) * CHANNELS;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// True when both frames share the same pixel buffer.
    pub fn same_buffer(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

// =============================================================================
// Frame stack
// =============================================================================

/// K consecutive frames, oldest first. Channel-concatenated when batched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameStack {
    frames: Vec<Frame>,
}

impl FrameStack {
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        let Some(first) = frames.first() else {
            bail!("frame stack needs at least one frame");
        };
        let dims = first.dims();
        ensure!(
            frames.iter().all(|f| f.dims() == dims),
            "frame stack mixes frame sizes"
        );
        Ok(Self { frames })
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn channels(&self) -> usize {
        self.frames.len() * CHANNELS
    }

    pub fn dims(&self) -> (usize, usize) {
        self.frames[0].dims()
    }
}

// =============================================================================
// Action encoding
// =============================================================================

/// A discrete action index together with the size of its action space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneHot {
    index: usize,
    num_actions: usize,
}

impl OneHot {
    pub fn new(index: usize, num_actions: usize) -> Result<Self> {
        ensure!(
            index < num_actions,
            "action {index} outside action space of size {num_actions}"
        );
        Ok(Self { index, num_actions })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn to_vec(&self) -> Vec<f32> {
        let mut v = vec![0.0f32; self.num_actions];
        v[self.index] = 1.0;
        v
    }
}

// =============================================================================
// Tensor conversion
// =============================================================================

fn common_dims<'a>(mut frames: impl Iterator<Item = &'a Frame>) -> Result<(usize, usize)> {
    let first = frames.next().context("cannot batch zero frames")?;
    let dims = first.dims();
    for f in frames {
        ensure!(
            f.dims() == dims,
            "batch mixes frame sizes {:?} and {:?}",
            dims,
            f.dims()
        );
    }
    Ok(dims)
}

/// Frames → u8 tensor of shape (B, 3, H, W).
pub fn frames_to_tensor(frames: &[Frame], device: &Device) -> Result<Tensor> {
    let (h, w) = common_dims(frames.iter())?;
    let mut data = Vec::with_capacity(frames.len() * h * w * CHANNELS);
    for f in frames {
        data.extend_from_slice(f.pixels());
    }
    let t = Tensor::from_vec(data, (frames.len(), h, w, CHANNELS), device)?
        .permute((0, 3, 1, 2))?
        .contiguous()?;
    Ok(t)
}

/// Frame stacks → u8 tensor of shape (B, 3K, H, W), oldest frame's channels first.
pub fn stacks_to_tensor(stacks: &[FrameStack], device: &Device) -> Result<Tensor> {
    let first = stacks.first().context("cannot batch zero frame stacks")?;
    let k = first.len();
    ensure!(
        stacks.iter().all(|s| s.len() == k),
        "batch mixes frame stacks of different depth"
    );
    let (h, w) = common_dims(stacks.iter().flat_map(|s| s.frames()))?;
    let mut data = Vec::with_capacity(stacks.len() * k * h * w * CHANNELS);
    for s in stacks {
        for f in s.frames() {
            data.extend_from_slice(f.pixels());
        }
    }
    let t = Tensor::from_vec(data, (stacks.len(), k, h, w, CHANNELS), device)?
        .permute((0, 1, 4, 2, 3))?
        .contiguous()?
        .reshape((stacks.len(), k * CHANNELS, h, w))?;
    Ok(t)
}

/// One-hot actions → f32 tensor of shape (B, A).
pub fn actions_to_tensor(actions: &[OneHot], device: &Device) -> Result<Tensor> {
    let first = actions.first().context("cannot batch zero actions")?;
    let n = first.num_actions();
    ensure!(
        actions.iter().all(|a| a.num_actions() == n),
        "batch mixes action spaces"
    );
    let mut data = Vec::with_capacity(actions.len() * n);
    for a in actions {
        data.extend(a.to_vec());
    }
    Ok(Tensor::from_vec(data, (actions.len(), n), device)?)
}

/// u8 tensor of shape (B, 3, H, W) → frames.
pub fn tensor_to_frames(t: &Tensor) -> Result<Vec<Frame>> {
    let (b, c, h, w) = t.dims4()?;
    ensure!(c == CHANNELS, "expected {CHANNELS} channels, got {c}");
    let flat = t
        .to_dtype(DType::U8)?
        .permute((0, 2, 3, 1))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let per_frame = h * w * CHANNELS;
    (0..b)
        .map(|i| Frame::new(h, w, flat[i * per_frame..(i + 1) * per_frame].to_vec()))
        .collect()
}
