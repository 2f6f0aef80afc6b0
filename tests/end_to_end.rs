use std::path::Path;

use srgan::checkpoint::CheckpointHandle;
use srgan::model::{ModelParameters, NetConfig};
use srgan::{
    CheckpointStore, Config, DataPipeline, FileCheckpointStore, ImageCorpus, MemorySink, Phase,
    Progress, Result, SrGan, Trainer,
};
use tch::{Device, Kind, Tensor};

/// File store that also remembers every save.
struct Tracking {
    inner: FileCheckpointStore,
    saves: Vec<Progress>,
}

impl CheckpointStore for Tracking {
    fn save(&mut self, params: ModelParameters<'_>, progress: &Progress) -> Result<CheckpointHandle> {
        self.saves.push(progress.clone());
        self.inner.save(params, progress)
    }

    fn exists(&self) -> bool {
        self.inner.exists()
    }

    fn load(&self, params: ModelParameters<'_>) -> Result<Option<Progress>> {
        self.inner.load(params)
    }
}

fn write_corpus(dir: &Path, n: usize) {
    for i in 0..n {
        let pixels = Tensor::randint(256, [3, 96, 96], (Kind::Int64, Device::Cpu));
        tch::vision::image::save(&pixels, dir.join(format!("img_{i:02}.png"))).unwrap();
    }
}

#[test]
fn ten_image_run_pretrains_trains_and_checkpoints() {
    let images = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    write_corpus(images.path(), 10);

    let config = Config {
        images: format!("{}/*.png", images.path().display()),
        logs_dir: work.path().join("logs"),
        checkpoint: work.path().join("checkpoint/weights"),
        hr_height: 96,
        hr_width: 96,
        upscale: 4,
        batch_size: 1,
        num_pretrain_epochs: 1,
        num_train_epochs: 1,
        train_ratio: 0.7,
        val_ratio: 0.2,
        residual_blocks: 2,
        run_test: true,
        no_progress: true,
        ..Config::default()
    };

    let corpus = ImageCorpus::discover(&config.images).unwrap();
    assert_eq!(corpus.len(), 10);
    let mut pipeline = DataPipeline::new(&corpus, &config).unwrap();
    let counts = pipeline.counts();
    assert_eq!(
        (counts.num_train_images, counts.num_val_images, counts.num_test_images),
        (7, 2, 1)
    );

    let store = Tracking { inner: FileCheckpointStore::new(&config.checkpoint), saves: Vec::new() };
    let mut trainer = Trainer::new(&config, counts, MemorySink::default(), store, Device::Cpu).unwrap();
    trainer.fit(&mut pipeline).unwrap();
    pipeline.shutdown();

    assert_eq!(trainer.phase(), Phase::Done);
    let state = trainer.state();
    assert_eq!(state.pretrain_iter, 7);
    assert_eq!(state.train_iter, 7);
    assert_eq!(state.val_iter, 2);
    assert_eq!(state.test_iter, 1);

    let metrics = trainer.metrics();
    assert_eq!(metrics.count("pretrain/mse_loss"), 7);
    assert_eq!(metrics.count("train/g_loss"), 7);
    assert_eq!(metrics.count("val/g_loss"), 2);
    assert_eq!(metrics.count("test/g_loss"), 1);
    assert!(metrics.graph.is_some());
    assert!(metrics.events.iter().all(|e| e.value.is_finite()));

    let saves = &trainer.store().saves;
    assert!(saves.iter().any(|p| p.phase == "pretraining" && p.pretrain_iter == 0));
    assert!(saves.iter().any(|p| p.phase == "adversarial" && p.train_iter == 0));
    assert!(config.logs_dir.join("samples/epoch-1.png").is_file());

    // The last checkpoint loads into a fresh model of the same shape.
    let fresh = SrGan::new(&NetConfig::from_config(&config), Device::Cpu);
    let progress = FileCheckpointStore::new(&config.checkpoint)
        .load(fresh.parameters())
        .unwrap()
        .unwrap();
    assert_eq!(progress.train_iter, 7);

    let lr = Tensor::randn([1, 24, 24, 3], (Kind::Float, Device::Cpu));
    let expected = trainer.model().generator.upscale(&lr, srgan::Mode::Inference);
    let actual = fresh.generator.upscale(&lr, srgan::Mode::Inference);
    assert!(expected.allclose(&actual, 1e-5, 1e-6, false));
}

#[test]
fn restoring_requires_an_existing_checkpoint() {
    let work = tempfile::tempdir().unwrap();
    let config = Config {
        checkpoint: work.path().join("missing/weights"),
        use_checkpoint: true,
        hr_height: 16,
        hr_width: 16,
        residual_blocks: 1,
        ..Config::default()
    };
    let counts = srgan::DerivedCounts {
        num_images: 3,
        num_train_images: 1,
        num_val_images: 1,
        num_test_images: 1,
        num_train_batches: 1,
        num_val_batches: 1,
        num_test_batches: 1,
    };
    let store = FileCheckpointStore::new(&config.checkpoint);
    let result = Trainer::new(&config, counts, MemorySink::default(), store, Device::Cpu);
    assert!(matches!(result, Err(srgan::SrganError::CheckpointMissing(_))));
}
