#[cfg(feature = "accelerate")]
extern crate accelerate_src;

pub mod batcher;
pub mod config;
pub mod eval;
pub mod frame;
pub mod generate;
pub mod model;
pub mod normalize;
pub mod optim;
pub mod predictor;
pub mod store;
pub mod trainer;
pub mod visualize;
pub mod window;

pub use batcher::{Batcher, Columns};
pub use config::{ExperimentConfig, GenerateConfig, TrainConfig};
pub use eval::{EvalStats, evaluate_held_out, first_held_out_batch};
pub use frame::{Frame, FrameStack, OneHot};
pub use generate::{Environment, EpsilonGreedy, Policy, Step, generate_dataset};
pub use model::{ForwardMode, NetworkConfig, PredictionNet, StreamMode};
pub use normalize::{InputKind, Normalizer, TensorBatch};
pub use optim::{Adam, OptimizerConfig};
pub use predictor::{Decomposition, Predictor};
pub use store::{DatasetMeta, Episode, EpisodeStore, MeanAccumulator, MeanFrame};
pub use trainer::{CheckpointPaths, TrainMeta, TrainSummary, Trainer, split_episodes};
pub use visualize::{SampleSet, export_samples, frame_grid};
pub use window::{Examples, FrameHistory, Windowed, extend_frames};
