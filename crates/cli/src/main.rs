//! ShardConv CLI
//!
//! Converts a HuggingFace Llama-family checkpoint into tensor-parallel shards.
//!
//! # Usage
//!
//! ```bash
//! # Four ranks, fp16 shards, eight worker threads
//! shardconv --input ./llama-7b --output ./llama-7b-tp4 --dtype fp16 --factor 4 --processes 8
//!
//! # Settings from a TOML file, flags override it
//! shardconv --config convert.toml --factor 2
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardconv_core::DType;
use shardconv_model::{convert_directory, ConvertConfig};

#[derive(Parser)]
#[command(name = "shardconv")]
#[command(version)]
#[command(about = "Split a dense checkpoint into tensor-parallel shards")]
#[command(long_about = r#"
ShardConv

Reads config.json and *.safetensors from the input directory and writes one
raw file per weight and rank (model.<weight>[.<rank>].bin) plus config.ini to
the output directory.

Settings are layered: built-in defaults, then --config, then SHARDCONV_*
environment variables, then the flags below.
"#)]
struct Cli {
    /// Directory with config.json and *.safetensors
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory receiving the shards
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Shard data type (fp32, fp16 or bf16)
    #[arg(short, long)]
    dtype: Option<DType>,

    /// Number of tensor-parallel ranks
    #[arg(short, long)]
    factor: Option<usize>,

    /// Number of worker threads
    #[arg(short, long)]
    processes: Option<usize>,

    /// TOML file with conversion settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<ConvertConfig> {
        let mut config = match &self.config {
            Some(path) => ConvertConfig::from_file(path)
                .with_context(|| format!("failed to read settings from {}", path.display()))?,
            None => ConvertConfig::default(),
        }
        .with_env_overrides();

        if let Some(input) = self.input {
            config.input_dir = input;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(dtype) = self.dtype {
            config.dtype = dtype;
        }
        if let Some(factor) = self.factor {
            config.factor = factor;
        }
        if let Some(processes) = self.processes {
            config.processes = processes;
        }

        config.validate()?;
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;
    tracing::info!("ShardConv v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Input: {}", config.input_dir.display());
    tracing::info!("Output: {}", config.output_dir.display());

    let report = convert_directory(&config)
        .with_context(|| format!("conversion of {} failed", config.input_dir.display()))?;

    if !report.is_complete() {
        tracing::warn!(
            "{} of {} weights were skipped, see warnings above",
            report.skipped.len(),
            report.skipped.len() + report.weights_written()
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "shardconv=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
