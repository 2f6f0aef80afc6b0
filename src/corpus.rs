use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::error::{Result, SrganError};

/// Image files discovered once at startup, in glob order.
#[derive(Debug, Clone)]
pub struct ImageCorpus {
    paths: Vec<PathBuf>,
}

impl ImageCorpus {
    pub fn discover(pattern: &str) -> Result<ImageCorpus> {
        let mut paths = Vec::new();
        for entry in glob::glob(pattern)? {
            let path = entry?;
            if path.is_file() {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(SrganError::EmptyCorpus { pattern: pattern.to_string() });
        }
        info!(images = paths.len(), pattern, "discovered image corpus");
        Ok(ImageCorpus { paths })
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> ImageCorpus {
        ImageCorpus { paths }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Prefix-slice partition: the first `floor(n * train_ratio)` files train,
    /// the next `floor(n * val_ratio)` validate, the rest test.
    pub fn split(&self, train_ratio: f64, val_ratio: f64) -> Split {
        let n = self.paths.len();
        let num_train = ((n as f64 * train_ratio).floor() as usize).min(n);
        let num_val = ((n as f64 * val_ratio).floor() as usize).min(n - num_train);
        Split {
            train: self.paths[..num_train].to_vec(),
            val: self.paths[num_train..num_train + num_val].to_vec(),
            test: self.paths[num_train + num_val..].to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Split {
    pub train: Vec<PathBuf>,
    pub val: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
}

impl Split {
    /// Computes batch counts, refusing splits that would yield no batches.
    pub fn counts(&self, batch_size: usize) -> Result<DerivedCounts> {
        for (split, images) in [("train", &self.train), ("validation", &self.val), ("test", &self.test)] {
            if images.len() < batch_size.max(1) {
                return Err(SrganError::DegenerateSplit {
                    split,
                    images: images.len(),
                    batch_size,
                });
            }
        }
        Ok(DerivedCounts {
            num_images: self.train.len() + self.val.len() + self.test.len(),
            num_train_images: self.train.len(),
            num_val_images: self.val.len(),
            num_test_images: self.test.len(),
            num_train_batches: self.train.len() / batch_size,
            num_val_batches: self.val.len() / batch_size,
            num_test_batches: self.test.len() / batch_size,
        })
    }
}

/// Corpus-dependent counts, computed once when the pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DerivedCounts {
    pub num_images: usize,
    pub num_train_images: usize,
    pub num_val_images: usize,
    pub num_test_images: usize,
    pub num_train_batches: usize,
    pub num_val_batches: usize,
    pub num_test_batches: usize,
}
