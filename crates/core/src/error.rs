//! Core error types

use thiserror::Error;

use crate::tensor::DType;

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while classifying, fusing, casting or splitting a weight
#[derive(Debug, Error)]
pub enum CoreError {
    /// The weight name matches no entry in the pattern catalog
    #[error("Cannot classify weight '{0}': no known sublayer pattern")]
    UnknownWeight(String),

    /// Dimensions inconsistent with the head layout or the shard factor
    #[error("Shape error for {name}: {detail}")]
    Shape { name: String, detail: String },

    #[error("Unsupported cast for {name}: {from} -> {to}")]
    UnsupportedCast { name: String, from: DType, to: DType },

    #[error("Invalid dtype tag: {0}")]
    InvalidDType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    pub(crate) fn shape(name: &str, detail: impl Into<String>) -> Self {
        CoreError::Shape {
            name: name.to_string(),
            detail: detail.into(),
        }
    }
}
