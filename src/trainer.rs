//! Two-phase training loop: reconstruction pretraining, then adversarial
//! training with a validation pass after every epoch, then an optional test
//! pass.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tch::{Device, Tensor};
use tqdm::tqdm;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointStore, Progress};
use crate::config::Config;
use crate::corpus::DerivedCounts;
use crate::error::{Result, SrganError};
use crate::loss::{self, GanLosses, LossAccumulator, LossValues};
use crate::metrics::MetricsSink;
use crate::model::{Mode, NetConfig, SrGan};
use crate::optim::Optimizers;
use crate::pipeline::{Batch, BatchSource, DataPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Pretraining,
    Adversarial,
    Testing,
    Done,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Pretraining => "pretraining",
            Phase::Adversarial => "adversarial",
            Phase::Testing => "testing",
            Phase::Done => "done",
        }
    }

    fn can_enter(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Uninitialized, Phase::Pretraining)
                | (Phase::Pretraining, Phase::Adversarial)
                | (Phase::Adversarial, Phase::Done)
                | (Phase::Done, Phase::Testing)
                | (Phase::Testing, Phase::Done)
        )
    }
}

#[derive(Debug, Default)]
pub struct TrainingState {
    pub pretrain_iter: u64,
    pub train_iter: u64,
    pub val_iter: u64,
    pub test_iter: u64,
    pub epoch: usize,
    pub train_losses: LossAccumulator,
    pub val_losses: LossAccumulator,
}

/// Epoch means of one adversarial epoch.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: LossValues,
    pub val: LossValues,
}

pub struct Trainer<M: MetricsSink, C: CheckpointStore> {
    config: Config,
    counts: DerivedCounts,
    model: SrGan,
    optim: Optimizers,
    metrics: M,
    store: C,
    state: TrainingState,
    phase: Phase,
}

impl<M: MetricsSink, C: CheckpointStore> Trainer<M, C> {
    /// Builds both networks and either restores them from `store` or keeps
    /// the fresh initialization, depending on `use_checkpoint`.
    pub fn new(config: &Config, counts: DerivedCounts, mut metrics: M, store: C, device: Device) -> Result<Self> {
        config.validate()?;
        info!("building model");
        tch::manual_seed(config.random_seed as i64);
        let model = SrGan::new(&NetConfig::from_config(config), device);

        if config.use_checkpoint {
            info!("restoring saved parameters");
            if let Some(progress) = store.load(model.parameters())? {
                info!(
                    phase = %progress.phase,
                    pretrain_iter = progress.pretrain_iter,
                    train_iter = progress.train_iter,
                    "checkpoint position is not resumed, training restarts from the first phase"
                );
            }
        } else {
            if store.exists() {
                warn!("ignoring existing checkpoint, it will be overwritten");
            }
            info!("initializing parameters");
        }

        let optim = Optimizers::new(&model, config.learning_rate, config.beta_1)?;
        let graph = model.graph();
        info!(parameters = graph.parameter_count(), "model ready");
        metrics.record_graph(&graph)?;

        Ok(Trainer {
            config: config.clone(),
            counts,
            model,
            optim,
            metrics,
            store,
            state: TrainingState::default(),
            phase: Phase::Uninitialized,
        })
    }

    pub fn model(&self) -> &SrGan {
        &self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn metrics(&self) -> &M {
        &self.metrics
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Pretraining, adversarial training and, when configured, testing.
    pub fn fit(&mut self, pipeline: &mut DataPipeline) -> Result<()> {
        self.pretrain(&mut pipeline.train)?;
        self.train_adversarial(&mut pipeline.train, &mut pipeline.val)?;
        if self.config.run_test {
            self.test(&mut pipeline.test)?;
        }
        Ok(())
    }

    pub fn pretrain(&mut self, train: &mut impl BatchSource) -> Result<()> {
        self.enter(Phase::Pretraining)?;
        info!("begin pre-training");
        for epoch in 0..self.config.num_pretrain_epochs {
            self.pretrain_epoch(epoch, train)?;
        }
        self.checkpoint()?;
        self.metrics.flush()
    }

    /// One pass over the training batches updating the generator on MSE.
    /// The discriminator only scores the batch so every loss is reported;
    /// it is neither updated nor moved off its running statistics.
    pub fn pretrain_epoch(&mut self, epoch: usize, train: &mut impl BatchSource) -> Result<LossValues> {
        self.require(Phase::Pretraining)?;
        self.state.epoch = epoch;
        info!(epoch, "pre-training epoch");

        let mut acc = LossAccumulator::default();
        for _ in self.steps(self.counts.num_train_batches) {
            let batch = train.next_batch()?.to_device(self.model.device());
            let reconstructed = self.model.generator.upscale(&batch.low_res, Mode::Training);
            let mse = loss::mse_loss(&batch.high_res, &reconstructed);
            self.optim.pretrain_step(&mse);

            let values = self.score(&batch, &reconstructed.detach());
            acc.add(&values);
            self.emit_all("pretrain", &values, self.state.pretrain_iter)?;
            if self.state.pretrain_iter % self.config.checkpoint_interval == 0 {
                self.checkpoint()?;
                info!(iter = self.state.pretrain_iter, "pre-training iter");
            }
            self.state.pretrain_iter += 1;
        }

        let mean = acc.mean();
        self.emit_all("pretrain/epoch", &mean, epoch as u64)?;
        info!(epoch, mse = mean.mse_loss, "pre-training epoch done");
        Ok(mean)
    }

    pub fn train_adversarial(&mut self, train: &mut impl BatchSource, val: &mut impl BatchSource) -> Result<()> {
        self.enter(Phase::Adversarial)?;
        info!("begin training");
        for epoch in 0..self.config.num_train_epochs {
            self.adversarial_epoch(epoch, train, val)?;
        }
        self.checkpoint()?;
        self.metrics.flush()?;
        self.enter(Phase::Done)
    }

    /// Training batches with both updates, then one validation pass.
    pub fn adversarial_epoch(
        &mut self,
        epoch: usize,
        train: &mut impl BatchSource,
        val: &mut impl BatchSource,
    ) -> Result<EpochReport> {
        self.require(Phase::Adversarial)?;
        self.state.epoch = epoch;
        self.state.train_losses.reset();
        self.state.val_losses.reset();
        info!(epoch, "training epoch");

        for _ in self.steps(self.counts.num_train_batches) {
            let batch = train.next_batch()?.to_device(self.model.device());
            let (_, losses) = self.forward(&batch, Mode::Training);
            self.optim.adversarial_step(&self.model, &losses);

            let values = losses.values();
            self.state.train_losses.add(&values);
            self.emit_all("train", &values, self.state.train_iter)?;
            if self.state.train_iter % self.config.checkpoint_interval == 0 {
                self.checkpoint()?;
                info!(iter = self.state.train_iter, "training iter");
            }
            self.state.train_iter += 1;
        }

        for i in self.steps(self.counts.num_val_batches) {
            let batch = val.next_batch()?.to_device(self.model.device());
            let (reconstructed, values) = self.evaluate(&batch);
            self.state.val_losses.add(&values);
            self.emit_all("val", &values, self.state.val_iter)?;
            self.state.val_iter += 1;
            if i == 0 && !self.config.no_samples {
                self.save_preview(&reconstructed, epoch)?;
            }
        }

        let report = EpochReport {
            epoch,
            train: self.state.train_losses.mean(),
            val: self.state.val_losses.mean(),
        };
        self.emit_all("train/epoch", &report.train, epoch as u64)?;
        self.emit_all("val/epoch", &report.val, epoch as u64)?;
        info!(
            epoch,
            g_loss = report.train.g_loss,
            d_loss = report.train.d_loss,
            val_g_loss = report.val.g_loss,
            val_d_loss = report.val.d_loss,
            "training epoch done"
        );
        Ok(report)
    }

    /// Replays the adversarial losses over the test split without updates.
    pub fn test(&mut self, test: &mut impl BatchSource) -> Result<LossValues> {
        self.enter(Phase::Testing)?;
        info!("begin testing");
        let mut acc = LossAccumulator::default();
        for _ in self.steps(self.counts.num_test_batches) {
            let batch = test.next_batch()?.to_device(self.model.device());
            let (_, values) = self.evaluate(&batch);
            acc.add(&values);
            self.emit_all("test", &values, self.state.test_iter)?;
            self.state.test_iter += 1;
        }
        let mean = acc.mean();
        self.emit_all("test/epoch", &mean, 0)?;
        self.metrics.flush()?;
        info!(g_loss = mean.g_loss, d_loss = mean.d_loss, mse = mean.mse_loss, "test done");
        self.enter(Phase::Done)?;
        Ok(mean)
    }

    /// `G` once and `D` twice on the same variables.
    fn forward(&self, batch: &Batch, mode: Mode) -> (Tensor, GanLosses) {
        let reconstructed = self.model.generator.upscale(&batch.low_res, mode);
        let d_real = self.model.discriminator.evaluate(&batch.high_res, mode);
        let d_fake = self.model.discriminator.evaluate(&reconstructed, mode);
        let losses = GanLosses::compute(
            &batch.high_res,
            &reconstructed,
            &d_real,
            &d_fake,
            self.config.adversarial_weight,
        );
        (reconstructed, losses)
    }

    fn evaluate(&self, batch: &Batch) -> (Tensor, LossValues) {
        tch::no_grad(|| {
            let (reconstructed, losses) = self.forward(batch, Mode::Inference);
            (reconstructed, losses.values())
        })
    }

    /// Losses of a given reconstruction, with `D` in inference mode.
    fn score(&self, batch: &Batch, reconstructed: &Tensor) -> LossValues {
        tch::no_grad(|| {
            let d_real = self.model.discriminator.evaluate(&batch.high_res, Mode::Inference);
            let d_fake = self.model.discriminator.evaluate(reconstructed, Mode::Inference);
            GanLosses::compute(&batch.high_res, reconstructed, &d_real, &d_fake, self.config.adversarial_weight)
                .values()
        })
    }

    fn emit_all(&mut self, prefix: &str, values: &LossValues, step: u64) -> Result<()> {
        for (name, value) in values.named() {
            self.metrics.emit(&format!("{prefix}/{name}"), value, step)?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        let progress = Progress {
            phase: self.phase.name().to_string(),
            pretrain_iter: self.state.pretrain_iter,
            train_iter: self.state.train_iter,
            epoch: self.state.epoch,
        };
        self.store.save(self.model.parameters(), &progress)?;
        Ok(())
    }

    /// First reconstruction of the batch, min-max scaled to 0..255.
    fn save_preview(&self, reconstructed: &Tensor, epoch: usize) -> Result<PathBuf> {
        let dir = self.config.logs_dir.join("samples");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("epoch-{}.png", epoch + 1));
        let image = reconstructed.get(0).permute([2, 0, 1]).to_device(Device::Cpu);
        let (lo, hi) = (image.min(), image.max());
        let scaled = (&image - &lo) / (hi - &lo).clamp_min(1e-8) * 255.0;
        tch::vision::image::save(&scaled, &path)?;
        Ok(path)
    }

    fn steps(&self, n: usize) -> Box<dyn Iterator<Item = usize>> {
        if self.config.no_progress {
            Box::new(0..n)
        } else {
            Box::new(tqdm(0..n))
        }
    }

    fn enter(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_enter(next) {
            return Err(SrganError::InvalidPhase { from: self.phase.name(), to: next.name() });
        }
        self.phase = next;
        Ok(())
    }

    fn require(&self, phase: Phase) -> Result<()> {
        if self.phase != phase {
            return Err(SrganError::InvalidPhase { from: self.phase.name(), to: phase.name() });
        }
        Ok(())
    }
}
