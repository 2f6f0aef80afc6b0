//! Streaming data pipeline.
//!
//! Every split gets one loader thread that walks its files in a freshly
//! shuffled order on each pass, decodes, standardizes and crops each image,
//! and feeds a bounded shuffle buffer. Batches drawn from the buffer are
//! downsampled into their low-resolution pair and handed to the compute
//! thread through a bounded channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tch::{Device, Kind, Tensor};
use tracing::{debug, info, warn};

use crate::config::{Config, MIN_AFTER_DEQUEUE, QUEUE_BATCHES};
use crate::corpus::{DerivedCounts, ImageCorpus};
use crate::error::{Result, SrganError};

const SEND_POLL: Duration = Duration::from_millis(50);

/// Paired batch, channels-last: `[B, H, W, C]`.
#[derive(Debug)]
pub struct Batch {
    pub low_res: Tensor,
    pub high_res: Tensor,
}

impl Batch {
    /// Stacks HR samples and derives the LR half by bicubic downsampling.
    pub fn assemble(samples: &[Tensor], config: &Config) -> Batch {
        let high_res = Tensor::stack(samples, 0);
        let low_res = high_res
            .permute([0, 3, 1, 2])
            .upsample_bicubic2d(
                [config.lr_height(), config.lr_width()],
                false,
                None::<f64>,
                None::<f64>,
            )
            .permute([0, 2, 3, 1])
            .contiguous();
        Batch { low_res, high_res }
    }

    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            low_res: self.low_res.to_device(device),
            high_res: self.high_res.to_device(device),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.high_res.size()[0]
    }
}

/// Anything the trainer can pull batches from.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Cooperative stop flag shared by the compute thread and the loaders.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded pool that approximates random order over a stream.
#[derive(Debug)]
pub struct ShuffleBuffer<T> {
    items: Vec<T>,
    capacity: usize,
    min_after_dequeue: usize,
    rng: StdRng,
}

impl<T> ShuffleBuffer<T> {
    pub fn new(capacity: usize, min_after_dequeue: usize, seed: u64) -> ShuffleBuffer<T> {
        ShuffleBuffer {
            items: Vec::with_capacity(capacity),
            capacity,
            min_after_dequeue,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn push(&mut self, item: T) {
        debug_assert!(!self.is_full(), "shuffle buffer overflow");
        self.items.push(item);
    }

    /// True once `n` items can leave while `min_after_dequeue` stay behind.
    pub fn can_dequeue(&self, n: usize) -> bool {
        self.items.len() >= n + self.min_after_dequeue
    }

    pub fn dequeue(&mut self, n: usize) -> Vec<T> {
        (0..n)
            .map(|_| {
                let i = self.rng.gen_range(0..self.items.len());
                self.items.swap_remove(i)
            })
            .collect()
    }
}

/// Per-image standardization: zero mean, unit variance, with the standard
/// deviation floored at `1/sqrt(numel)`.
pub fn standardize(image: &Tensor) -> Tensor {
    let image = image.to_kind(Kind::Float);
    let floor = 1.0 / (image.numel() as f64).sqrt();
    let mean = image.mean(Kind::Float);
    let std = image.std(false).clamp_min(floor);
    (image - mean) / std
}

/// Decodes one image and returns a standardized random HR crop, `[H, W, C]`.
pub fn load_sample(path: &Path, config: &Config, rng: &mut impl Rng) -> Result<Tensor> {
    let decoded = tch::vision::image::load(path).map_err(|source| SrganError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let image = match config.num_channels {
        1 => {
            let rgb = decoded.to_kind(Kind::Float);
            ((rgb.get(0) + rgb.get(1) + rgb.get(2)) / 3.0).unsqueeze(0)
        }
        _ => decoded,
    };
    let (height, width) = (image.size()[1], image.size()[2]);
    if height < config.hr_height || width < config.hr_width {
        return Err(SrganError::ImageTooSmall {
            path: path.to_path_buf(),
            height,
            width,
            crop_h: config.hr_height,
            crop_w: config.hr_width,
        });
    }
    let top = rng.gen_range(0..=height - config.hr_height);
    let left = rng.gen_range(0..=width - config.hr_width);
    let sample = standardize(&image)
        .narrow(1, top, config.hr_height)
        .narrow(2, left, config.hr_width)
        .permute([1, 2, 0])
        .contiguous();
    Ok(sample)
}

/// Endless walk over a split: every pass visits each item exactly once, in
/// an order reshuffled at the start of the pass.
#[derive(Debug)]
pub struct Passes<T> {
    items: Vec<T>,
    next: usize,
    rng: StdRng,
}

impl<T: Clone> Passes<T> {
    pub fn new(items: Vec<T>, seed: u64) -> Passes<T> {
        Passes { items, next: 0, rng: StdRng::seed_from_u64(seed) }
    }
}

impl<T: Clone> Iterator for Passes<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        if self.next == 0 {
            self.items.shuffle(&mut self.rng);
        }
        let item = self.items[self.next].clone();
        self.next = (self.next + 1) % self.items.len();
        Some(item)
    }
}

/// Consumer end of one split's queue.
#[derive(Debug)]
pub struct BatchStream {
    split: &'static str,
    rx: Receiver<Result<Batch>>,
}

impl BatchSource for BatchStream {
    fn next_batch(&mut self) -> Result<Batch> {
        match self.rx.recv() {
            Ok(batch) => batch,
            Err(_) => Err(SrganError::PipelineClosed { split: self.split }),
        }
    }
}

struct Loader {
    split: &'static str,
    files: Passes<PathBuf>,
    config: Arc<Config>,
    rng: StdRng,
    buffer: ShuffleBuffer<Tensor>,
    tx: Sender<Result<Batch>>,
    cancel: CancelToken,
}

impl Loader {
    fn run(mut self) {
        match self.produce() {
            Ok(()) => debug!(split = self.split, "loader stopped"),
            Err(err) => {
                warn!(split = self.split, %err, "loader failed");
                self.send(Err(err));
            }
        }
    }

    fn produce(&mut self) -> Result<()> {
        while let Some(path) = self.files.next() {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let sample = load_sample(&path, &self.config, &mut self.rng)?;
            self.buffer.push(sample);
            if !self.drain() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Emits batches while the consumer has room. When its queue is full the
    /// buffer keeps filling, and only a full buffer blocks on the send.
    fn drain(&mut self) -> bool {
        let batch_size = self.config.batch_size;
        while self.buffer.can_dequeue(batch_size) && (self.buffer.is_full() || !self.tx.is_full()) {
            let samples = self.buffer.dequeue(batch_size);
            let batch = Batch::assemble(&samples, &self.config);
            if !self.send(Ok(batch)) {
                return false;
            }
        }
        true
    }

    fn send(&self, mut item: Result<Batch>) -> bool {
        loop {
            match self.tx.send_timeout(item, SEND_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}

/// Train, validation and test streams plus the loader threads behind them.
pub struct DataPipeline {
    pub train: BatchStream,
    pub val: BatchStream,
    pub test: BatchStream,
    counts: DerivedCounts,
    cancel: CancelToken,
    workers: Vec<JoinHandle<()>>,
}

impl DataPipeline {
    pub fn new(corpus: &ImageCorpus, config: &Config) -> Result<DataPipeline> {
        let split = corpus.split(config.train_ratio, config.val_ratio);
        let counts = split.counts(config.batch_size)?;
        info!(
            images = counts.num_images,
            train = counts.num_train_images,
            val = counts.num_val_images,
            test = counts.num_test_images,
            "running on {} images",
            counts.num_images
        );

        let config = Arc::new(config.clone());
        let cancel = CancelToken::default();
        let mut workers = Vec::with_capacity(3);
        let mut spawn = |index: u64, name: &'static str, files: Vec<PathBuf>| -> Result<BatchStream> {
            let (tx, rx) = bounded(QUEUE_BATCHES);
            let seed = config.random_seed.wrapping_add(3 * index);
            let loader = Loader {
                split: name,
                files: Passes::new(files, seed.wrapping_add(2)),
                rng: StdRng::seed_from_u64(seed),
                buffer: ShuffleBuffer::new(config.shuffle_capacity(), MIN_AFTER_DEQUEUE, seed.wrapping_add(1)),
                config: Arc::clone(&config),
                tx,
                cancel: cancel.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("loader-{name}"))
                .spawn(move || loader.run())?;
            workers.push(handle);
            Ok(BatchStream { split: name, rx })
        };
        let train = spawn(0, "train", split.train)?;
        let val = spawn(1, "validation", split.val)?;
        let test = spawn(2, "test", split.test)?;

        Ok(DataPipeline { train, val, test, counts, cancel, workers })
    }

    pub fn counts(&self) -> DerivedCounts {
        self.counts
    }

    /// Stops every loader and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("loader thread panicked");
            }
        }
    }
}

impl Drop for DataPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
