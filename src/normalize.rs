use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

use crate::frame::{CHANNELS, actions_to_tensor, frames_to_tensor, stacks_to_tensor};
use crate::store::MeanFrame;
use crate::window::Examples;

/// Network-ready tensors for one minibatch.
pub struct TensorBatch {
    /// (B, 3K, H, W), normalized
    pub x: Tensor,
    /// (B, A), one-hot
    pub a: Tensor,
    /// (B, 3, H, W), normalized
    pub y: Tensor,
}

/// What a pixel batch holds. Declared by the caller, never inferred from shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// (B, 3, H, W)
    Frame,
    /// (B, 3K, H, W)
    Stack,
}

/// Centers pixel batches on the dataset mean and scales them to unit range.
pub struct Normalizer {
    mean: Tensor,
    stacked_mean: Tensor,
    history_length: usize,
}

impl Normalizer {
    pub fn new(mean: &MeanFrame, history_length: usize, device: &Device) -> Result<Self> {
        ensure!(history_length > 0, "history length must be positive");
        ensure!(
            mean.values.len() == CHANNELS * mean.height * mean.width,
            "mean frame does not match its dimensions"
        );
        let mean = Tensor::from_slice(&mean.values, (CHANNELS, mean.height, mean.width), device)?;
        let stacked_mean = Tensor::cat(&vec![&mean; history_length], 0)?;
        Ok(Self {
            mean,
            stacked_mean,
            history_length,
        })
    }

    pub fn history_length(&self) -> usize {
        self.history_length
    }

    fn expected_channels(&self, kind: InputKind) -> usize {
        match kind {
            InputKind::Frame => CHANNELS,
            InputKind::Stack => CHANNELS * self.history_length,
        }
    }

    /// `(x - mean) / 255`, with the mean tiled across the stack for stacks.
    pub fn pre_process(&self, x: &Tensor, kind: InputKind) -> Result<Tensor> {
        let (_, c, h, w) = x.dims4()?;
        let expected = self.expected_channels(kind);
        ensure!(
            c == expected,
            "{kind:?} batch has {c} channels, expected {expected}"
        );
        let (_, mh, mw) = self.mean.dims3()?;
        ensure!(
            (h, w) == (mh, mw),
            "batch frames are {h}x{w}, dataset frames are {mh}x{mw}"
        );
        let mean = match kind {
            InputKind::Frame => &self.mean,
            InputKind::Stack => &self.stacked_mean,
        };
        let y = x
            .to_dtype(DType::F32)?
            .broadcast_sub(mean)?
            .affine(1.0 / 255.0, 0.0)?;
        Ok(y)
    }

    pub fn batch(&self, examples: &Examples, device: &Device) -> Result<TensorBatch> {
        let (stacks, actions, targets) = examples;
        let x = self.pre_process(&stacks_to_tensor(stacks, device)?, InputKind::Stack)?;
        let a = actions_to_tensor(actions, device)?;
        let y = self.pre_process(&frames_to_tensor(targets, device)?, InputKind::Frame)?;
        Ok(TensorBatch { x, a, y })
    }

    /// Back to 8-bit pixels: `clamp(y * 255 + mean, 0, 255)`, rounded.
    pub fn post_process(&self, y: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = y.dims4()?;
        ensure!(c == CHANNELS, "prediction has {c} channels, expected {CHANNELS}");
        let px = y
            .to_dtype(DType::F32)?
            .affine(255.0, 0.0)?
            .broadcast_add(&self.mean)?
            .clamp(0f32, 255f32)?
            .round()?
            .to_dtype(DType::U8)?;
        Ok(px)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_frame(h: usize, w: usize) -> MeanFrame {
        let values = (0..CHANNELS * h * w)
            .map(|i| (i % 255) as f32 + 0.37)
            .collect();
        MeanFrame {
            height: h,
            width: w,
            values,
        }
    }

    fn pixels(b: usize, c: usize, h: usize, w: usize) -> Tensor {
        let data: Vec<u8> = (0..b * c * h * w).map(|i| ((i * 37) % 256) as u8).collect();
        Tensor::from_vec(data, (b, c, h, w), &Device::Cpu).unwrap()
    }

    #[test]
    fn round_trip_recovers_pixels() {
        let norm = Normalizer::new(&mean_frame(5, 7), 4, &Device::Cpu).unwrap();
        let x = pixels(3, 3, 5, 7);
        let back = norm
            .post_process(&norm.pre_process(&x, InputKind::Frame).unwrap())
            .unwrap();
        let a = x.flatten_all().unwrap().to_vec1::<u8>().unwrap();
        let b = back.flatten_all().unwrap().to_vec1::<u8>().unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((*p as i16 - *q as i16).abs() <= 1, "{p} vs {q}");
        }
    }

    #[test]
    fn stack_subtracts_tiled_mean() {
        let mean = mean_frame(2, 2);
        let norm = Normalizer::new(&mean, 4, &Device::Cpu).unwrap();
        let x = pixels(1, 12, 2, 2);
        let y = norm.pre_process(&x, InputKind::Stack).unwrap();
        assert_eq!(y.dims(), &[1, 12, 2, 2]);
        let xs = x.flatten_all().unwrap().to_vec1::<u8>().unwrap();
        let ys = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let plane = CHANNELS * 4;
        for (i, (&p, &v)) in xs.iter().zip(&ys).enumerate() {
            let expected = (p as f32 - mean.values[i % plane]) / 255.0;
            assert!((v - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn rejects_undeclared_layout() {
        let norm = Normalizer::new(&mean_frame(2, 2), 4, &Device::Cpu).unwrap();
        assert!(norm.pre_process(&pixels(1, 3, 2, 2), InputKind::Stack).is_err());
        assert!(norm.pre_process(&pixels(1, 12, 2, 2), InputKind::Frame).is_err());
        assert!(norm.pre_process(&pixels(1, 3, 3, 2), InputKind::Frame).is_err());
    }

    #[test]
    fn post_process_saturates() {
        let norm = Normalizer::new(&mean_frame(1, 1), 1, &Device::Cpu).unwrap();
        let y = Tensor::from_vec(vec![10.0f32, -10.0, 0.0], (1, 3, 1, 1), &Device::Cpu).unwrap();
        let px = norm
            .post_process(&y)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<u8>()
            .unwrap();
        assert_eq!(px[0], 255);
        assert_eq!(px[1], 0);
        assert_eq!(px[2], 2);
    }
}
