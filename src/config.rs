use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SrganError};

/// Samples kept in the shuffle buffer after every dequeue.
pub const MIN_AFTER_DEQUEUE: usize = 1;

/// Batches a loader may queue ahead of the compute thread.
pub const QUEUE_BATCHES: usize = 2;

/// Hyperparameters for one training run. Built once and never mutated;
/// counts that depend on the corpus live in [`crate::corpus::DerivedCounts`].
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(version, about = "SRGAN super-resolution training via Rust.", long_about = None)]
pub struct Config {
    /// Glob pattern for the training images.
    #[arg(long, default_value = "images/*.png")]
    pub images: String,
    #[arg(long, default_value = "logs/")]
    pub logs_dir: PathBuf,
    /// Checkpoint path prefix; `.g.ot`, `.d.ot` and `.json` are appended.
    #[arg(long, default_value = "checkpoint/weights")]
    pub checkpoint: PathBuf,
    /// Restore parameters from `--checkpoint` before training.
    #[arg(long, default_value_t = false)]
    pub use_checkpoint: bool,
    #[arg(long, default_value_t = 96)]
    pub hr_height: i64,
    #[arg(long, default_value_t = 96)]
    pub hr_width: i64,
    /// Upscale factor; must be a power of two.
    #[arg(short = 'r', long = "upscale", default_value_t = 4)]
    pub upscale: i64,
    #[arg(long, default_value_t = 3)]
    pub num_channels: i64,
    #[arg(long, default_value_t = 24)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 120)]
    pub num_pretrain_epochs: usize,
    #[arg(long, default_value_t = 20)]
    pub num_train_epochs: usize,
    #[arg(long, default_value_t = 0.7)]
    pub train_ratio: f64,
    #[arg(long, default_value_t = 0.2)]
    pub val_ratio: f64,
    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,
    #[arg(long = "beta-1", default_value_t = 0.9)]
    pub beta_1: f64,
    #[arg(long, default_value_t = 1337)]
    pub random_seed: u64,
    /// Save a checkpoint every this many iterations of a phase.
    #[arg(long, default_value_t = 1000)]
    pub checkpoint_interval: u64,
    /// Weight of the adversarial term in the generator loss.
    #[arg(long, default_value_t = 1e-3)]
    pub adversarial_weight: f64,
    #[arg(long, default_value_t = 16)]
    pub residual_blocks: usize,
    #[arg(long, default_value_t = 1e-3)]
    pub bn_epsilon: f64,
    #[arg(long, default_value_t = 0.9997)]
    pub bn_decay: f64,
    /// Evaluate on the test split once training is done.
    #[arg(long, default_value_t = false)]
    pub run_test: bool,
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
    /// Skip writing reconstruction previews after each epoch.
    #[arg(long, default_value_t = false)]
    pub no_samples: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["srgan-rs"])
    }
}

impl Config {
    pub fn lr_height(&self) -> i64 {
        self.hr_height / self.upscale
    }

    pub fn lr_width(&self) -> i64 {
        self.hr_width / self.upscale
    }

    /// Number of stride-2 deconvolution blocks needed to reach `upscale`.
    pub fn deconv_blocks(&self) -> usize {
        self.upscale.trailing_zeros() as usize
    }

    pub fn shuffle_capacity(&self) -> usize {
        MIN_AFTER_DEQUEUE + 3 * self.batch_size
    }

    /// Running-statistics momentum as torch counts it.
    pub fn bn_momentum(&self) -> f64 {
        1.0 - self.bn_decay
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SrganError::InvalidConfig(msg));

        if self.upscale < 2 || self.upscale & (self.upscale - 1) != 0 {
            return invalid(format!("upscale factor {} is not a power of two", self.upscale));
        }
        if self.hr_height <= 0 || self.hr_width <= 0 {
            return invalid(format!("bad HR size {}x{}", self.hr_height, self.hr_width));
        }
        if self.hr_height % self.upscale != 0 || self.hr_width % self.upscale != 0 {
            return invalid(format!(
                "HR size {}x{} is not divisible by {}",
                self.hr_height, self.hr_width, self.upscale
            ));
        }
        if self.num_channels != 1 && self.num_channels != 3 {
            return invalid(format!("{} channels, expected 1 or 3", self.num_channels));
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive".into());
        }
        let ratios = [self.train_ratio, self.val_ratio];
        if ratios.iter().any(|r| !(0.0..=1.0).contains(r)) || self.train_ratio + self.val_ratio > 1.0 {
            return invalid(format!(
                "split ratios {} + {} must lie in [0, 1]",
                self.train_ratio, self.val_ratio
            ));
        }
        if !(self.learning_rate > 0.0) {
            return invalid(format!("learning rate {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.beta_1) {
            return invalid(format!("beta_1 {} outside [0, 1)", self.beta_1));
        }
        if self.checkpoint_interval == 0 {
            return invalid("checkpoint interval must be positive".into());
        }
        if !self.adversarial_weight.is_finite() || self.adversarial_weight < 0.0 {
            return invalid(format!("adversarial weight {}", self.adversarial_weight));
        }
        if self.residual_blocks == 0 {
            return invalid("generator needs at least one residual block".into());
        }
        if !(self.bn_epsilon > 0.0) || !(self.bn_decay > 0.0 && self.bn_decay < 1.0) {
            return invalid(format!(
                "batch norm epsilon {} / decay {}",
                self.bn_epsilon, self.bn_decay
            ));
        }
        Ok(())
    }

    /// Writes the resolved configuration next to the logs.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
