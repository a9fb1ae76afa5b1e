//! Conversion error types

use std::fmt;
use std::path::PathBuf;

use shardconv_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Model not found at path: {0}")]
    ModelNotFound(String),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Missing weight: {0}")]
    MissingWeight(String),

    #[error("Attention projection {name} has no matching {missing}")]
    UnpairedProjection { name: String, missing: String },

    #[error("Unsupported data type for {name}: {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("Model config error: {0}")]
    Config(String),

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Which part of the pipeline a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureKind {
    /// The weight name matched no known sublayer
    Classification,
    /// Dimensions disagree with the head layout or shard factor
    Shape,
    /// A shard could not be written
    Io,
    /// The checkpoint, its configuration or a tensor dtype is unusable
    Source,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Classification => "classification",
            FailureKind::Shape => "shape",
            FailureKind::Io => "io",
            FailureKind::Source => "source",
        };
        f.write_str(s)
    }
}

impl ModelError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ModelError::Core(CoreError::UnknownWeight(_)) => FailureKind::Classification,
            ModelError::Core(CoreError::Shape { .. }) => FailureKind::Shape,
            ModelError::Write { .. } | ModelError::Io(_) => FailureKind::Io,
            _ => FailureKind::Source,
        }
    }
}
