//! ShardConv Model - checkpoint loading and shard conversion
//!
//! Reads HuggingFace Llama-family checkpoints (`config.json` plus
//! `*.safetensors`) and writes them out as per-rank raw shard files with a
//! `config.ini` describing the model.
//!
//! ```no_run
//! use shardconv_core::DType;
//! use shardconv_model::{convert_directory, ConvertConfig};
//!
//! let config = ConvertConfig::new("llama-7b", "llama-7b-tp4")
//!     .with_dtype(DType::F16)
//!     .with_factor(4);
//! let report = convert_directory(&config)?;
//! assert!(report.files_written() > 0);
//! # Ok::<(), shardconv_model::ModelError>(())
//! ```

mod config;
mod converter;
mod error;
mod loader;
mod metadata;
mod report;
mod settings;
mod source;
mod writer;

pub use config::{ModelHyperparameters, TokenIds};
pub use converter::{convert, convert_directory, ConversionPlan, WeightTask};
pub use error::{FailureKind, ModelError, Result};
pub use loader::{list_safetensor_files, SafetensorsLoader};
pub use metadata::{metadata_entries, render_config_ini, write_config_ini, METADATA_FILE, METADATA_SECTION};
pub use report::{ConversionReport, SkippedWeight, WrittenWeight};
pub use settings::ConvertConfig;
pub use source::{InMemorySource, ModelSource};
pub use writer::{write_shard, ShardWriter, WrittenShard, DEFAULT_PREFIX, SHARD_EXTENSION};
