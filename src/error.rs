use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SrganError>;

/// Every failure the trainer can report. All of them are fatal for the phase
/// that raised them.
#[derive(Error, Debug)]
pub enum SrganError {
    /// The image glob matched no files.
    #[error("no images match `{pattern}`")]
    EmptyCorpus { pattern: String },

    /// A split ended up too small to yield a single batch.
    #[error("{split} split has {images} image(s), need at least {batch_size} for one batch")]
    DegenerateSplit {
        split: &'static str,
        images: usize,
        batch_size: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: tch::TchError,
    },

    #[error("{path} is {height}x{width}, smaller than the {crop_h}x{crop_w} crop")]
    ImageTooSmall {
        path: PathBuf,
        height: i64,
        width: i64,
        crop_h: i64,
        crop_w: i64,
    },

    #[error("checkpoint {0} does not exist")]
    CheckpointMissing(PathBuf),

    #[error("failed to load checkpoint: {0}")]
    CheckpointLoad(String),

    #[error("{split} loader stopped")]
    PipelineClosed { split: &'static str },

    #[error("cannot move from {from} to {to}")]
    InvalidPhase {
        from: &'static str,
        to: &'static str,
    },

    #[error("bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
