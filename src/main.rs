use anyhow::Result;
use clap::Parser;
use tch::Device;
use tracing::info;

use srgan::{Config, DataPipeline, FileCheckpointStore, ImageCorpus, TensorboardSink, Trainer};

fn main() -> Result<()> {
    srgan::logging::init_tracing()?;
    let config = Config::parse();

    config.validate()?;

    let device = Device::cuda_if_available();
    info!(?device, "using device");
    info!(
        images = %config.images,
        hr = %format!("{}x{}", config.hr_height, config.hr_width),
        upscale = config.upscale,
        batch_size = config.batch_size,
        pretrain_epochs = config.num_pretrain_epochs,
        train_epochs = config.num_train_epochs,
        learning_rate = config.learning_rate,
        adversarial_weight = config.adversarial_weight,
        "configuration"
    );
    config.save_json(&config.logs_dir.join("config.json"))?;

    let corpus = ImageCorpus::discover(&config.images)?;
    let mut pipeline = DataPipeline::new(&corpus, &config)?;
    let metrics = TensorboardSink::create(&config.logs_dir)?;
    let store = FileCheckpointStore::new(&config.checkpoint);
    let mut trainer = Trainer::new(&config, pipeline.counts(), metrics, store, device)?;

    let result = trainer.fit(&mut pipeline);
    pipeline.shutdown();
    result?;
    info!("done");
    Ok(())
}
