use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("dataset directory does not exist: {0}")]
    DatasetNotFound(PathBuf),

    #[error("failed to decode image '{path}': {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("decoded image '{path}' has an unexpected layout: {reason}")]
    ImageLayout { path: PathBuf, reason: String },

    #[error("no images found under {root} for classes {allowed:?}")]
    EmptyDataset { root: PathBuf, allowed: Vec<String> },

    /// A one-hot encoding over fewer than two classes cannot separate anything.
    #[error("degenerate label set: need at least two classes, found {0:?}")]
    DegenerateLabels(Vec<String>),

    #[error("label '{0}' is not known to the encoder")]
    UnknownLabel(String),

    #[error("class index {0} is out of range")]
    UnknownClassIndex(usize),

    #[error("cannot stratify: {0}")]
    Split(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("model record error: {0}")]
    Record(String),

    #[error("failed to render plot: {0}")]
    Plot(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Record(format!("{err:?}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
