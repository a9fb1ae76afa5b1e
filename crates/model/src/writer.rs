//! Raw shard files
//!
//! Each shard is written as a flat dump of its element buffer: no magic, no
//! header, no length prefix. Shapes and dtype are recorded separately in
//! `config.ini`, so a reader must know them to interpret the bytes.
//!
//! File naming: `<output_dir>/model.<weight>[.<rank>].bin`

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use shardconv_core::NamedTensor;

use crate::error::{ModelError, Result};

/// Extension of every shard file
pub const SHARD_EXTENSION: &str = "bin";

/// Namespace prefix every shard file name carries
pub const DEFAULT_PREFIX: &str = "model.";

/// One file produced by the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenShard {
    pub path: PathBuf,
    pub rank: Option<usize>,
    pub bytes: u64,
}

/// Writes shards into one output directory
#[derive(Debug, Clone)]
pub struct ShardWriter {
    output_dir: PathBuf,
    prefix: String,
}

impl ShardWriter {
    pub fn new(output_dir: impl AsRef<Path>, prefix: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Create the output directory if it does not exist
    pub fn create_output_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).map_err(|e| ModelError::Write {
            path: self.output_dir.clone(),
            source: e,
        })
    }

    /// File name for a weight, e.g. `model.layers.0.mlp.up_proj.weight.1.bin`
    pub fn file_name(&self, base_name: &str, rank: Option<usize>) -> String {
        let mut name = if base_name.starts_with(&self.prefix) {
            base_name.to_string()
        } else {
            format!("{}{}", self.prefix, base_name)
        };
        if let Some(rank) = rank {
            name.push_str(&format!(".{}", rank));
        }
        name.push('.');
        name.push_str(SHARD_EXTENSION);
        name
    }

    pub fn shard_path(&self, base_name: &str, rank: Option<usize>) -> PathBuf {
        self.output_dir.join(self.file_name(base_name, rank))
    }

    /// Write one shard, replacing any existing file
    pub fn write(&self, tensor: &NamedTensor, base_name: &str, rank: Option<usize>) -> Result<WrittenShard> {
        let path = self.shard_path(base_name, rank);
        let to_write_error = |e: std::io::Error| ModelError::Write {
            path: path.clone(),
            source: e,
        };

        let file = File::create(&path).map_err(to_write_error)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(tensor.as_bytes()).map_err(to_write_error)?;
        writer.flush().map_err(to_write_error)?;

        tracing::debug!(
            "Wrote {} ({:?} {}, {} bytes)",
            path.display(),
            tensor.shape(),
            tensor.dtype(),
            tensor.size_bytes()
        );

        Ok(WrittenShard {
            path,
            rank,
            bytes: tensor.size_bytes() as u64,
        })
    }
}

/// Write a shard to `output_dir` with the default `model.` prefix
pub fn write_shard(
    tensor: &NamedTensor,
    base_name: &str,
    rank: Option<usize>,
    output_dir: impl AsRef<Path>,
) -> Result<WrittenShard> {
    ShardWriter::new(output_dir, DEFAULT_PREFIX).write(tensor, base_name, rank)
}
