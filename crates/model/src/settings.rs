//! Conversion settings
//!
//! Layered lowest to highest precedence: defaults, a TOML file, environment
//! variables, then whatever the caller (usually the CLI) sets explicitly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shardconv_core::DType;

use crate::error::{ModelError, Result};
use crate::writer::DEFAULT_PREFIX;

/// Settings for one conversion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Directory holding config.json and *.safetensors
    pub input_dir: PathBuf,
    /// Directory receiving the shard files and config.ini
    pub output_dir: PathBuf,
    /// Element type of the written shards
    pub dtype: DType,
    /// Number of tensor-parallel ranks
    pub factor: usize,
    /// Number of worker threads
    pub processes: usize,
    /// Namespace prefix of every shard file
    pub model_prefix: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("model"),
            output_dir: PathBuf::from("model-tp"),
            dtype: DType::F16,
            factor: 1,
            processes: std::thread::available_parallelism().map_or(1, |n| n.get()),
            model_prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl ConvertConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_factor(mut self, factor: usize) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    /// Override fields from `SHARDCONV_*` environment variables
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("SHARDCONV_INPUT_DIR") {
            self.input_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("SHARDCONV_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Ok(dtype) = std::env::var("SHARDCONV_DTYPE") {
            match dtype.parse() {
                Ok(d) => self.dtype = d,
                Err(e) => tracing::warn!("Ignoring SHARDCONV_DTYPE: {}", e),
            }
        }
        if let Ok(factor) = std::env::var("SHARDCONV_FACTOR") {
            match factor.parse() {
                Ok(f) => self.factor = f,
                Err(_) => tracing::warn!("Ignoring SHARDCONV_FACTOR={:?}: not an integer", factor),
            }
        }
        if let Ok(processes) = std::env::var("SHARDCONV_PROCESSES") {
            match processes.parse() {
                Ok(p) => self.processes = p,
                Err(_) => tracing::warn!("Ignoring SHARDCONV_PROCESSES={:?}: not an integer", processes),
            }
        }
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ModelError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.factor == 0 {
            return Err(ModelError::Config("factor must be at least 1".to_string()));
        }
        if self.processes == 0 {
            return Err(ModelError::Config("processes must be at least 1".to_string()));
        }
        if !self.dtype.is_float() {
            return Err(ModelError::Config(format!(
                "weights cannot be converted to {}; choose fp32, fp16 or bf16",
                self.dtype
            )));
        }
        Ok(())
    }
}
