use anyhow::{Result, bail, ensure};
use candle_core::Tensor;
use candle_nn::{Init, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::frame::CHANNELS;

// =============================================================================
// Modes
// =============================================================================

/// Latent layout, fixed when the network is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    /// Visual latent multiplied by the action embedding.
    #[default]
    Single,
    /// Action-independent latent `y` concatenated with `y * action`.
    TwoStream,
}

/// Which latent components reach the decoder on a given call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Normal,
    /// Zero `y`, keep `y * action`. Two-stream only.
    IsolateAction,
    /// Keep `y`, zero `y * action`. Two-stream only.
    IsolateIndependent,
}

// =============================================================================
// Architecture config
// =============================================================================

/// One stride-2 encoder convolution. The decoder mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub kernel: usize,
    pub stride: usize,
    /// (rows, cols)
    pub padding: (usize, usize),
}

pub const ENCODER_LAYERS: [ConvSpec; 4] = [
    ConvSpec {
        kernel: 8,
        stride: 2,
        padding: (0, 1),
    },
    ConvSpec {
        kernel: 6,
        stride: 2,
        padding: (1, 1),
    },
    ConvSpec {
        kernel: 6,
        stride: 2,
        padding: (1, 1),
    },
    ConvSpec {
        kernel: 4,
        stride: 2,
        padding: (0, 0),
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub frame_height: usize,
    pub frame_width: usize,
    /// Frames per input stack (K).
    pub history_length: usize,
    pub encoder_channels: [usize; 4],
    /// Outputs of the first three transposed convolutions; the last one emits RGB.
    pub decoder_channels: [usize; 3],
    pub latent_dim: usize,
    pub streams: StreamMode,
    /// Uniform init range of the visual projection and the decoder bottleneck.
    pub fusion_init_range: f64,
    /// Uniform init range of the action embedding.
    pub action_init_range: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            frame_height: 210,
            frame_width: 160,
            history_length: 4,
            encoder_channels: [64, 128, 128, 128],
            decoder_channels: [128, 128, 128],
            latent_dim: 2048,
            streams: StreamMode::Single,
            fusion_init_range: 1.0,
            action_init_range: 0.1,
        }
    }
}

fn conv_out(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    (input + 2 * pad)
        .checked_sub(kernel)
        .map(|span| span / stride + 1)
}

/// Spatial size before each encoder layer plus the bottleneck size.
pub fn encoder_sizes(height: usize, width: usize) -> Result<[(usize, usize); 5]> {
    let mut sizes = [(height, width); 5];
    for (i, spec) in ENCODER_LAYERS.iter().enumerate() {
        let (h, w) = sizes[i];
        let (Some(oh), Some(ow)) = (
            conv_out(h, spec.kernel, spec.stride, spec.padding.0),
            conv_out(w, spec.kernel, spec.stride, spec.padding.1),
        ) else {
            bail!("{height}x{width} frames are too small for encoder layer {}", i + 1);
        };
        sizes[i + 1] = (oh, ow);
    }
    Ok(sizes)
}

// =============================================================================
// Layers
// =============================================================================

fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

fn bias_init(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Linear layer whose weight is drawn from `U(-range, range)`.
fn uniform_linear(in_dim: usize, out_dim: usize, range: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -range,
            up: range,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", bias_init(in_dim))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Convolution with independent row/column zero padding.
struct EncoderConv {
    weight: Tensor,
    bias: Tensor,
    spec: ConvSpec,
}

impl EncoderConv {
    fn new(in_c: usize, out_c: usize, spec: ConvSpec, vb: VarBuilder) -> Result<Self> {
        let k = spec.kernel;
        let bound = xavier_bound(in_c * k * k, out_c * k * k);
        let weight = vb.get_with_hints(
            (out_c, in_c, k, k),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(out_c, "bias", bias_init(in_c * k * k))?;
        Ok(Self { weight, bias, spec })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (ph, pw) = self.spec.padding;
        let x = x.pad_with_zeros(2, ph, ph)?.pad_with_zeros(3, pw, pw)?;
        let y = x.conv2d(&self.weight, 0, self.spec.stride, 1, 1)?;
        let c = self.bias.dim(0)?;
        y.broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

/// Transposed convolution cropped (or extended) to an exact output size.
struct DecoderDeconv {
    weight: Tensor,
    bias: Tensor,
    spec: ConvSpec,
    out_size: (usize, usize),
}

impl DecoderDeconv {
    fn new(
        in_c: usize,
        out_c: usize,
        spec: ConvSpec,
        out_size: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let k = spec.kernel;
        let bound = xavier_bound(in_c * k * k, out_c * k * k);
        let weight = vb.get_with_hints(
            (in_c, out_c, k, k),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(out_c, "bias", bias_init(out_c * k * k))?;
        Ok(Self {
            weight,
            bias,
            spec,
            out_size,
        })
    }

    fn fit_dim(x: Tensor, dim: usize, crop: usize, len: usize) -> candle_core::Result<Tensor> {
        let full = x.dim(dim)?;
        let x = if crop + len > full {
            x.pad_with_zeros(dim, 0, crop + len - full)?
        } else {
            x
        };
        x.narrow(dim, crop, len)
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let y = x.conv_transpose2d(&self.weight, 0, 0, self.spec.stride, 1)?;
        let (ph, pw) = self.spec.padding;
        let (oh, ow) = self.out_size;
        let y = Self::fit_dim(y, 2, ph, oh)?;
        let y = Self::fit_dim(y, 3, pw, ow)?;
        let c = self.bias.dim(0)?;
        y.broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

// =============================================================================
// Prediction network
// =============================================================================

/// Action-conditional next-frame predictor.
///
/// Input: normalized (B, 3K, H, W) frame stack and (B, A) one-hot action.
/// Output: normalized (B, 3, H, W) next frame.
pub struct PredictionNet {
    encoder: Vec<EncoderConv>,
    encode_fc: Linear,
    fusion_fc: Linear,
    action_fc: Linear,
    decode_fc: Linear,
    expand_fc: Linear,
    decoder: Vec<DecoderDeconv>,
    bottleneck: (usize, usize, usize),
    streams: StreamMode,
}

impl PredictionNet {
    pub fn new(vb: VarBuilder, config: &NetworkConfig, num_actions: usize) -> Result<Self> {
        ensure!(num_actions > 0, "action space is empty");
        ensure!(config.history_length > 0, "history length must be positive");
        let sizes = encoder_sizes(config.frame_height, config.frame_width)?;

        let mut in_c = CHANNELS * config.history_length;
        let mut encoder = Vec::with_capacity(ENCODER_LAYERS.len());
        for (i, spec) in ENCODER_LAYERS.iter().enumerate() {
            let out_c = config.encoder_channels[i];
            encoder.push(EncoderConv::new(in_c, out_c, *spec, vb.pp(format!("conv{}", i + 1)))?);
            in_c = out_c;
        }

        let (bh, bw) = sizes[4];
        let hidden = in_c * bh * bw;
        let latent = config.latent_dim;
        let encode_fc = candle_nn::linear(hidden, latent, vb.pp("fc_encode_in"))?;
        let fusion_fc = uniform_linear(latent, latent, config.fusion_init_range, vb.pp("fc_fusion"))?;
        let action_fc = uniform_linear(
            num_actions,
            latent,
            config.action_init_range,
            vb.pp("fc_action"),
        )?;
        let decode_in = match config.streams {
            StreamMode::Single => latent,
            StreamMode::TwoStream => 2 * latent,
        };
        let decode_fc = uniform_linear(decode_in, latent, config.fusion_init_range, vb.pp("fc_decode"))?;
        let expand_fc = candle_nn::linear(latent, hidden, vb.pp("fc_decode_out"))?;

        // Mirror the encoder: layer i undoes encoder layer 3 - i.
        let mut decoder = Vec::with_capacity(ENCODER_LAYERS.len());
        let mut dec_in = in_c;
        for i in 0..ENCODER_LAYERS.len() {
            let mirrored = ENCODER_LAYERS.len() - 1 - i;
            let out_c = config.decoder_channels.get(i).copied().unwrap_or(CHANNELS);
            decoder.push(DecoderDeconv::new(
                dec_in,
                out_c,
                ENCODER_LAYERS[mirrored],
                sizes[mirrored],
                vb.pp(format!("deconv{}", i + 1)),
            )?);
            dec_in = out_c;
        }

        Ok(Self {
            encoder,
            encode_fc,
            fusion_fc,
            action_fc,
            decode_fc,
            expand_fc,
            decoder,
            bottleneck: (in_c, bh, bw),
            streams: config.streams,
        })
    }

    pub fn streams(&self) -> StreamMode {
        self.streams
    }

    pub fn forward(&self, obs: &Tensor, action: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        if self.streams == StreamMode::Single && mode != ForwardMode::Normal {
            bail!("{mode:?} needs a two-stream network");
        }

        let mut x = obs.clone();
        for conv in &self.encoder {
            x = conv.forward(&x)?.relu()?;
        }
        let x = x.flatten_from(1)?;
        let x = self.encode_fc.forward(&x)?.relu()?;
        let action = self.action_fc.forward(action)?;

        let fused = match self.streams {
            StreamMode::Single => self.fusion_fc.forward(&x)?.mul(&action)?,
            StreamMode::TwoStream => {
                let y = self.fusion_fc.forward(&x)?;
                let y_action = y.mul(&action)?;
                match mode {
                    ForwardMode::Normal => Tensor::cat(&[&y, &y_action], 1)?,
                    ForwardMode::IsolateAction => Tensor::cat(&[&y.zeros_like()?, &y_action], 1)?,
                    ForwardMode::IsolateIndependent => {
                        Tensor::cat(&[&y, &y_action.zeros_like()?], 1)?
                    }
                }
            }
        };

        let x = self.decode_fc.forward(&fused)?;
        let x = self.expand_fc.forward(&x)?.relu()?;
        let (c, h, w) = self.bottleneck;
        let batch = x.dim(0)?;
        let mut x = x.reshape((batch, c, h, w))?;
        let last = self.decoder.len() - 1;
        for (i, deconv) in self.decoder.iter().enumerate() {
            x = deconv.forward(&x)?;
            if i < last {
                x = x.relu()?;
            }
        }
        Ok(x)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use rstest::rstest;

    pub(crate) fn tiny_config(height: usize, width: usize, streams: StreamMode) -> NetworkConfig {
        NetworkConfig {
            frame_height: height,
            frame_width: width,
            history_length: 4,
            encoder_channels: [4, 4, 4, 16],
            decoder_channels: [4, 4, 4],
            latent_dim: 16,
            streams,
            ..NetworkConfig::default()
        }
    }

    fn build(config: &NetworkConfig, num_actions: usize) -> (VarMap, PredictionNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = PredictionNet::new(vb, config, num_actions).unwrap();
        (varmap, net)
    }

    fn one_hot(index: usize, n: usize) -> Tensor {
        let mut v = vec![0f32; n];
        v[index] = 1.0;
        Tensor::from_vec(v, (1, n), &Device::Cpu).unwrap()
    }

    #[test]
    fn default_geometry_matches_atari_frames() {
        let sizes = encoder_sizes(210, 160).unwrap();
        assert_eq!(sizes[1], (102, 78));
        assert_eq!(sizes[2], (50, 38));
        assert_eq!(sizes[3], (24, 18));
        assert_eq!(sizes[4], (11, 8));
    }

    #[test]
    fn tiny_frames_are_rejected() {
        assert!(encoder_sizes(20, 20).is_err());
        let config = tiny_config(20, 20, StreamMode::Single);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(PredictionNet::new(vb, &config, 3).is_err());
    }

    #[rstest]
    #[case(50, 48, StreamMode::Single)]
    #[case(51, 49, StreamMode::Single)]
    #[case(53, 62, StreamMode::TwoStream)]
    fn output_matches_input_frame_size(
        #[case] h: usize,
        #[case] w: usize,
        #[case] streams: StreamMode,
    ) {
        let config = tiny_config(h, w, streams);
        let (_, net) = build(&config, 3);
        let obs = Tensor::zeros((2, 12, h, w), DType::F32, &Device::Cpu).unwrap();
        let action = Tensor::cat(&[one_hot(0, 3), one_hot(2, 3)], 0).unwrap();
        let y = net.forward(&obs, &action, ForwardMode::Normal).unwrap();
        assert_eq!(y.dims(), &[2, 3, h, w]);
    }

    #[test]
    fn single_stream_refuses_isolation() {
        let config = tiny_config(50, 48, StreamMode::Single);
        let (_, net) = build(&config, 3);
        let obs = Tensor::zeros((1, 12, 50, 48), DType::F32, &Device::Cpu).unwrap();
        assert!(
            net.forward(&obs, &one_hot(1, 3), ForwardMode::IsolateAction)
                .is_err()
        );
    }

    #[test]
    fn isolated_independent_path_ignores_action() {
        let config = tiny_config(50, 48, StreamMode::TwoStream);
        let (_, net) = build(&config, 3);
        let obs = Tensor::rand(-1f32, 1f32, (1, 12, 50, 48), &Device::Cpu).unwrap();

        let flat = |t: Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let indep_a = flat(
            net.forward(&obs, &one_hot(0, 3), ForwardMode::IsolateIndependent)
                .unwrap(),
        );
        let indep_b = flat(
            net.forward(&obs, &one_hot(2, 3), ForwardMode::IsolateIndependent)
                .unwrap(),
        );
        assert_eq!(indep_a, indep_b);

        let act_a = flat(
            net.forward(&obs, &one_hot(0, 3), ForwardMode::IsolateAction)
                .unwrap(),
        );
        let act_b = flat(
            net.forward(&obs, &one_hot(2, 3), ForwardMode::IsolateAction)
                .unwrap(),
        );
        assert_ne!(act_a, act_b);
    }
}
