//! Checkpoint to tensor-parallel shard conversion
//!
//! A run has three phases:
//! 1. Plan: walk the checkpoint names once and turn them into an immutable
//!    list of [`WeightTask`]s. Unpaired attention projections abort the run
//!    here, before anything is written.
//! 2. Execute: a rayon pool of `processes` workers runs the tasks. Each task
//!    loads its own tensors from the source, so memory stays bounded by the
//!    weights in flight.
//! 3. Join: every task outcome is collected into a [`ConversionReport`]. A
//!    failing weight is recorded and never stops the others.

use std::collections::HashSet;
use std::time::Instant;

use rayon::prelude::*;

use shardconv_core::{classify, fuse_qkv, split, to_in_out, AttentionHeads, NamedTensor, ParallelismStrategy};

use crate::config::ModelHyperparameters;
use crate::error::{FailureKind, ModelError, Result};
use crate::loader::SafetensorsLoader;
use crate::metadata::write_config_ini;
use crate::report::{ConversionReport, SkippedWeight, WrittenWeight};
use crate::settings::ConvertConfig;
use crate::source::ModelSource;
use crate::writer::ShardWriter;

const QUERY_PROJ: &str = "self_attn.q_proj.weight";
const KEY_PROJ: &str = "self_attn.k_proj.weight";
const VALUE_PROJ: &str = "self_attn.v_proj.weight";
const OUTPUT_PROJ: &str = "self_attn.o_proj.weight";
const FUSED_QKV: &str = "attention.query_key_value.weight";
const ATTENTION_DENSE: &str = "attention.dense.weight";

/// Checkpoint tensors written whole under a fixed name
const WHOLE_TENSORS: &[(&str, &str)] = &[
    ("model.embed_tokens.weight", "model.wte"),
    ("model.norm.weight", "model.final_layernorm.weight"),
    ("lm_head.weight", "model.lm_head.weight"),
];

/// Name fragments of embedding and output-head weights, which keep the
/// checkpoint layout instead of being transposed to `[in, out]`
const UNTRANSPOSED: &[&str] = &["embed", "lm_head"];

fn keeps_checkpoint_layout(name: &str) -> bool {
    UNTRANSPOSED.iter().any(|fragment| name.contains(fragment))
}

/// One unit of work for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightTask {
    /// Cast and write as-is, no rank suffix, no transpose
    Whole { source: String, target: String },
    /// Transpose to `[in, out]` unless it is an embedding or output-head
    /// weight, then split with `strategy`
    Sharded {
        source: String,
        target: String,
        strategy: ParallelismStrategy,
    },
    /// Fuse q/k/v into one tensor, then split per rank
    FusedQkv {
        query: String,
        key: String,
        value: String,
        target: String,
    },
}

impl WeightTask {
    /// Checkpoint name the task is reported under
    pub fn source_name(&self) -> &str {
        match self {
            WeightTask::Whole { source, .. } | WeightTask::Sharded { source, .. } => source,
            WeightTask::FusedQkv { query, .. } => query,
        }
    }

    /// Name of the weight in the sharded layout
    pub fn target_name(&self) -> &str {
        match self {
            WeightTask::Whole { target, .. }
            | WeightTask::Sharded { target, .. }
            | WeightTask::FusedQkv { target, .. } => target,
        }
    }
}

/// Every task of a run plus the names that were rejected while planning
#[derive(Debug, Clone, Default)]
pub struct ConversionPlan {
    pub tasks: Vec<WeightTask>,
    pub skipped: Vec<SkippedWeight>,
}

impl ConversionPlan {
    /// Build the plan from checkpoint tensor names
    ///
    /// Fails if a q/k/v projection is missing one of its siblings.
    pub fn from_names(names: &[String]) -> Result<Self> {
        let present: HashSet<&str> = names.iter().map(String::as_str).collect();
        let require = |name: &str, sibling: String| -> Result<String> {
            if present.contains(sibling.as_str()) {
                Ok(sibling)
            } else {
                Err(ModelError::UnpairedProjection {
                    name: name.to_string(),
                    missing: sibling,
                })
            }
        };

        let mut plan = ConversionPlan::default();
        for name in names {
            if let Some(&(_, target)) = WHOLE_TENSORS.iter().find(|(source, _)| *source == name.as_str()) {
                plan.tasks.push(WeightTask::Whole {
                    source: name.clone(),
                    target: target.to_string(),
                });
            } else if name.contains(QUERY_PROJ) {
                let key = require(name.as_str(), name.replace(QUERY_PROJ, KEY_PROJ))?;
                let value = require(name.as_str(), name.replace(QUERY_PROJ, VALUE_PROJ))?;
                plan.tasks.push(WeightTask::FusedQkv {
                    query: name.clone(),
                    key,
                    value,
                    target: name.replace(QUERY_PROJ, FUSED_QKV),
                });
            } else if name.contains(KEY_PROJ) {
                require(name.as_str(), name.replace(KEY_PROJ, QUERY_PROJ))?;
            } else if name.contains(VALUE_PROJ) {
                require(name.as_str(), name.replace(VALUE_PROJ, QUERY_PROJ))?;
            } else {
                let target = name.replace(OUTPUT_PROJ, ATTENTION_DENSE);
                match classify(&target) {
                    Ok(strategy) => plan.tasks.push(WeightTask::Sharded {
                        source: name.clone(),
                        target,
                        strategy,
                    }),
                    Err(e) => plan.skipped.push(SkippedWeight {
                        name: name.clone(),
                        kind: FailureKind::Classification,
                        reason: e.to_string(),
                    }),
                }
            }
        }

        Ok(plan)
    }
}

/// Shared read-only state of the workers
struct TaskRunner<'a> {
    source: &'a dyn ModelSource,
    config: &'a ConvertConfig,
    heads: AttentionHeads,
    writer: ShardWriter,
}

impl TaskRunner<'_> {
    fn load(&self, name: &str) -> Result<NamedTensor> {
        Ok(self.source.load_tensor(name)?.cast(self.config.dtype)?)
    }

    fn run(&self, task: &WeightTask) -> Result<WrittenWeight> {
        match task {
            WeightTask::Whole { source, target } => {
                let tensor = self.load(source)?;
                let shard = self.writer.write(&tensor, target, None)?;
                Ok(WrittenWeight {
                    name: target.clone(),
                    strategy: None,
                    shards: vec![shard],
                })
            }
            WeightTask::Sharded {
                source,
                target,
                strategy,
            } => {
                let tensor = self.load(source)?;
                let tensor = if keeps_checkpoint_layout(source) {
                    tensor
                } else {
                    to_in_out(tensor)?
                };
                self.split_and_write(tensor.renamed(target.as_str()), *strategy)
            }
            WeightTask::FusedQkv {
                query,
                key,
                value,
                target,
            } => {
                let fused = fuse_qkv(self.load(query)?, self.load(key)?, self.load(value)?)?;
                self.split_and_write(fused.renamed(target.as_str()), ParallelismStrategy::FusedAttentionSplit)
            }
        }
    }

    fn split_and_write(&self, tensor: NamedTensor, strategy: ParallelismStrategy) -> Result<WrittenWeight> {
        let name = tensor.name.clone();
        let shards = split(tensor, strategy, self.config.factor, self.heads)?;

        let mut written = Vec::with_capacity(shards.len());
        for (rank, shard) in shards.iter().enumerate() {
            let rank = strategy.is_sharded().then_some(rank);
            written.push(self.writer.write(shard, &name, rank)?);
        }

        Ok(WrittenWeight {
            name,
            strategy: Some(strategy),
            shards: written,
        })
    }
}

/// Convert every weight of `source` into shards under `config.output_dir`
///
/// Returns an error only for run-level failures: invalid settings, unusable
/// hyperparameters, an unpaired attention projection or an output directory
/// that cannot be created. Per-weight failures end up in the report.
pub fn convert(source: &dyn ModelSource, config: &ConvertConfig) -> Result<ConversionReport> {
    let start = Instant::now();
    config.validate()?;

    let writer = ShardWriter::new(&config.output_dir, config.model_prefix.clone());
    writer.create_output_dir()?;

    let hparams: &ModelHyperparameters = source.hyperparameters();
    hparams.validate()?;
    match write_config_ini(&config.output_dir, hparams, config.dtype) {
        Ok(path) => tracing::info!("Wrote model metadata to {}", path.display()),
        Err(e) => tracing::warn!("Could not write model metadata: {}", e),
    }

    let plan = ConversionPlan::from_names(&source.tensor_names())?;
    tracing::info!(
        "Converting {} weights to {} with factor {} on {} workers ({} skipped while planning)",
        plan.tasks.len(),
        config.dtype,
        config.factor,
        config.processes,
        plan.skipped.len()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.processes)
        .thread_name(|i| format!("shardconv-worker-{}", i))
        .build()
        .map_err(|e| ModelError::Config(format!("failed to start worker pool: {}", e)))?;

    let runner = TaskRunner {
        source,
        config,
        heads: hparams.attention_heads(),
        writer,
    };
    let outcomes: Vec<(&WeightTask, Result<WrittenWeight>)> =
        pool.install(|| plan.tasks.par_iter().map(|task| (task, runner.run(task))).collect());

    let mut report = ConversionReport {
        skipped: plan.skipped,
        ..Default::default()
    };
    for (task, outcome) in outcomes {
        match outcome {
            Ok(weight) => report.written.push(weight),
            Err(e) => report.skipped.push(SkippedWeight {
                name: task.source_name().to_string(),
                kind: e.kind(),
                reason: e.to_string(),
            }),
        }
    }
    report.elapsed = start.elapsed();

    report.log_summary();
    Ok(report)
}

/// Open the checkpoint at `config.input_dir` and convert it
pub fn convert_directory(config: &ConvertConfig) -> Result<ConversionReport> {
    let source = SafetensorsLoader::from_directory(&config.input_dir)?;
    convert(&source, config)
}
