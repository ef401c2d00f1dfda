// error.rs

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("class directory '{0}' is missing")]
    MissingClassDir(PathBuf),

    #[error("class directory '{0}' contains no images")]
    EmptyClassDir(PathBuf),

    #[error("class directory '{path}' has {found} images, at least {required} are needed")]
    TooFewImages {
        path: PathBuf,
        found: usize,
        required: usize,
    },

    #[error("'{0}' is not a known waste category")]
    UnknownCategory(String),

    #[error("label {0} is outside the category set")]
    LabelOutOfRange(i64),

    #[error("category count {found} does not match the {expected} known categories")]
    CategoryCount { expected: usize, found: usize },

    #[error("cannot decode '{path}' as an RGB image: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("cannot write image '{path}': {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("unknown backbone '{0}'")]
    UnknownBackbone(String),

    #[error("pretrained weights: {0}")]
    PretrainedWeights(String),

    #[error("checkpoint '{path}' does not fit the model: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },

    #[error("non-finite {phase} loss in stage {stage}, epoch {epoch}")]
    NonFiniteLoss {
        stage: u8,
        epoch: usize,
        phase: &'static str,
    },

    #[error("trainer is in state {state}, cannot {action}")]
    TrainerState {
        state: &'static str,
        action: &'static str,
    },

    #[error("split '{0}' has no samples")]
    EmptySplit(PathBuf),

    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("failed to parse configuration: {0}")]
    ConfigFormat(#[from] toml::de::Error),

    #[error("metrics sink: {0}")]
    Metrics(String),

    #[error("loader worker stopped: {0}")]
    Worker(String),

    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Attaches the offending path to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
