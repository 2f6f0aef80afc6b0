//! Super-resolution GAN training on top of libtorch.
//!
//! A residual generator learns to upscale low-resolution crops by a power of
//! two, first on pixel MSE alone and then against a convolutional
//! discriminator.

pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod trainer;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, Progress};
pub use config::Config;
pub use corpus::{DerivedCounts, ImageCorpus};
pub use error::{Result, SrganError};
pub use metrics::{MemorySink, MetricsSink, TensorboardSink};
pub use model::{Mode, SrGan};
pub use pipeline::{Batch, BatchSource, DataPipeline};
pub use trainer::{Phase, Trainer};
