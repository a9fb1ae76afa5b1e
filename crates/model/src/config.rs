//! Model hyperparameters read from a HuggingFace `config.json`

use serde::{Deserialize, Serialize};
use std::path::Path;

use shardconv_core::AttentionHeads;

use crate::error::{ModelError, Result};

/// Token id field that may hold one id or a list (newer Llama configs)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    /// First id, used where the runtime expects a single token
    pub fn primary(&self) -> Option<u32> {
        match self {
            TokenIds::Single(id) => Some(*id),
            TokenIds::Multiple(ids) => ids.first().copied(),
        }
    }
}

/// Hyperparameters of a Llama-family checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHyperparameters {
    /// Name or path the checkpoint was saved under
    #[serde(rename = "_name_or_path", default)]
    pub name_or_path: String,

    /// Hidden size (embedding dimension)
    pub hidden_size: usize,

    /// Intermediate size (FFN hidden dimension)
    pub intermediate_size: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA); absent means multi-head attention
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Maximum sequence length
    pub max_position_embeddings: usize,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    pub bos_token_id: TokenIds,
    pub eos_token_id: TokenIds,
}

fn default_rms_norm_eps() -> f64 { 1e-6 }

impl ModelHyperparameters {
    /// Load config from a JSON file (config.json from HuggingFace)
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModelError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Head dimension (`size_per_head`)
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn attention_heads(&self) -> AttentionHeads {
        AttentionHeads::new(self.num_attention_heads, self.num_kv_heads())
    }

    /// Model name recorded in the metadata, `llama` when the checkpoint has none
    pub fn model_name(&self) -> &str {
        if self.name_or_path.is_empty() {
            "llama"
        } else {
            &self.name_or_path
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let kv_heads = self.num_kv_heads();
        if self.num_attention_heads == 0 || kv_heads == 0 {
            return Err(ModelError::Config("head counts must be positive".to_string()));
        }
        if kv_heads > self.num_attention_heads {
            return Err(ModelError::Config(format!(
                "num_key_value_heads ({}) exceeds num_attention_heads ({})",
                kv_heads, self.num_attention_heads
            )));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::Config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % kv_heads != 0 {
            return Err(ModelError::Config(format!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                self.num_attention_heads, kv_heads
            )));
        }
        for (field, ids) in [("bos_token_id", &self.bos_token_id), ("eos_token_id", &self.eos_token_id)] {
            if ids.primary().is_none() {
                return Err(ModelError::Config(format!("{} is an empty list", field)));
            }
        }
        Ok(())
    }
}
