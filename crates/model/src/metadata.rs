//! `config.ini` written next to the shards
//!
//! The inference runtime reads model hyperparameters from a single `[llama]`
//! section of plain `key = value` lines.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use shardconv_core::DType;

use crate::config::ModelHyperparameters;
use crate::error::{ModelError, Result};

pub const METADATA_FILE: &str = "config.ini";
pub const METADATA_SECTION: &str = "llama";

/// Key/value pairs in the order they are written
pub fn metadata_entries(config: &ModelHyperparameters, dtype: DType) -> Vec<(&'static str, String)> {
    let token = |ids: &crate::config::TokenIds| ids.primary().map(|id| id.to_string()).unwrap_or_default();

    vec![
        ("model_name", config.model_name().to_string()),
        ("head_num", config.num_attention_heads.to_string()),
        ("kv_head_num", config.num_kv_heads().to_string()),
        ("size_per_head", config.head_dim().to_string()),
        ("inter_size", config.intermediate_size.to_string()),
        ("max_pos_seq_len", config.max_position_embeddings.to_string()),
        ("num_layer", config.num_hidden_layers.to_string()),
        ("layernorm_eps", format_epsilon(config.rms_norm_eps)),
        ("layernorm_type", "pre_layernorm".to_string()),
        ("activation_type", "silu".to_string()),
        ("has_post_decoder_layernorm", "1".to_string()),
        ("vocab_size", config.vocab_size.to_string()),
        ("start_id", token(&config.bos_token_id)),
        ("end_id", token(&config.eos_token_id)),
        ("weight_data_type", dtype.tag().to_string()),
    ]
}

/// Format a float the way the runtime's own configs spell it: plain decimals
/// in `[1e-4, 1e16)`, otherwise scientific with a signed two-digit exponent
/// (`1e-05`, `2.5e-07`)
pub fn format_epsilon(value: f64) -> String {
    let magnitude = value.abs();
    if value == 0.0 || (1e-4..1e16).contains(&magnitude) {
        return value.to_string();
    }

    let scientific = format!("{:e}", value);
    match scientific.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => scientific,
    }
}

/// Render the full `config.ini` contents
pub fn render_config_ini(config: &ModelHyperparameters, dtype: DType) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[{}]", METADATA_SECTION);
    for (key, value) in metadata_entries(config, dtype) {
        let _ = writeln!(out, "{} = {}", key, value);
    }
    out.push('\n');
    out
}

/// Write `config.ini` into the output directory
pub fn write_config_ini(output_dir: &Path, config: &ModelHyperparameters, dtype: DType) -> Result<PathBuf> {
    let path = output_dir.join(METADATA_FILE);
    std::fs::write(&path, render_config_ini(config, dtype)).map_err(|e| ModelError::Write {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}
