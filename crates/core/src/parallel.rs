//! Tensor-parallel sharding of checkpoint weights
//!
//! Every weight is assigned one [`ParallelismStrategy`] from its name and then
//! cut into one shard per rank.
//!
//! # Strategies for a Llama-style decoder layer
//!
//! Weights arrive here already transposed to `[in_features, out_features]`.
//!
//! - layer norms, output-projection bias: replicated, written once
//! - `mlp.{gate,up,down}_proj.weight`: split along axis 0
//! - `attention.query_key_value.weight`: fused split, query/key/value blocks are
//!   split independently and re-concatenated per rank so every rank keeps whole
//!   heads and the same query-to-kv grouping
//! - `attention.dense.weight`: split along axis 0
//!
//! ## Fused QKV for GQA (H=32, K=8, S=128) on 4 ranks
//! - full:  `[4096, 4096 | 1024 | 1024]` = 6144 columns
//! - rank j: `[1024 | 256 | 256]` = 1536 columns

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::layout::{AttentionHeadLayout, AttentionHeads};
use crate::tensor::{shape, NamedTensor};

/// How a weight is distributed across tensor-parallel ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParallelismStrategy {
    /// Same tensor on every rank; stored once without a rank suffix
    Replicate,
    /// Equal contiguous slices along axis 0
    SplitRows,
    /// Equal slices along the last axis
    SplitColumns,
    /// Query/key/value blocks split independently, then re-fused per rank
    FusedAttentionSplit,
}

impl ParallelismStrategy {
    /// Whether shards carry a `.<rank>` suffix on disk
    pub fn is_sharded(&self) -> bool {
        !matches!(self, ParallelismStrategy::Replicate)
    }
}

/// Name fragments and the strategy they select, in priority order
pub const WEIGHT_PATTERNS: &[(&str, ParallelismStrategy)] = &[
    ("input_layernorm.weight", ParallelismStrategy::Replicate),
    ("input_layernorm.bias", ParallelismStrategy::Replicate),
    ("attention.dense.bias", ParallelismStrategy::Replicate),
    ("post_attention_layernorm.weight", ParallelismStrategy::Replicate),
    ("post_attention_layernorm.bias", ParallelismStrategy::Replicate),
    ("mlp.dense_4h_to_h.bias", ParallelismStrategy::Replicate),
    ("final_layernorm.weight", ParallelismStrategy::Replicate),
    ("final_layernorm.bias", ParallelismStrategy::Replicate),
    ("mlp.gate_proj.weight", ParallelismStrategy::SplitRows),
    ("mlp.up_proj.weight", ParallelismStrategy::SplitRows),
    ("mlp.down_proj.weight", ParallelismStrategy::SplitRows),
    ("attention.query_key_value.weight", ParallelismStrategy::FusedAttentionSplit),
    ("attention.dense.weight", ParallelismStrategy::SplitRows),
];

/// Pick the parallelism strategy for a weight name (first match wins)
pub fn classify(name: &str) -> Result<ParallelismStrategy> {
    WEIGHT_PATTERNS
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .map(|&(_, strategy)| strategy)
        .ok_or_else(|| CoreError::UnknownWeight(name.to_string()))
}

/// Calculate the `[start, end)` range of one shard along a dimension
pub fn calculate_shard_indices(dim_size: usize, shard_id: usize, num_shards: usize) -> (usize, usize) {
    let shard_size = dim_size / num_shards;
    let start = shard_id * shard_size;
    (start, start + shard_size)
}

/// Copy columns `[start, end)` of the last axis out of a row-major buffer
pub fn slice_last_axis(data: &[u8], shape: &[usize], dtype_size: usize, start: usize, end: usize) -> Vec<u8> {
    let (outer, cols) = shape::outer_inner(shape);
    let row_bytes = cols * dtype_size;
    let mut result = Vec::with_capacity(outer * (end - start) * dtype_size);

    for row in 0..outer {
        let row_start = row * row_bytes;
        result.extend_from_slice(&data[row_start + start * dtype_size..row_start + end * dtype_size]);
    }

    result
}

/// Slice tensor data for one shard along axis 0 or the last axis
pub fn slice_tensor_data(
    data: &[u8],
    shape: &[usize],
    dtype_size: usize,
    shard_dim: usize,
    shard_id: usize,
    num_shards: usize,
) -> Vec<u8> {
    let (start, end) = calculate_shard_indices(shape[shard_dim], shard_id, num_shards);

    if shard_dim == 0 {
        // Rows are contiguous
        let row_bytes = shape::numel(&shape[1..]) * dtype_size;
        return data[start * row_bytes..end * row_bytes].to_vec();
    }

    debug_assert_eq!(shard_dim, shape.len() - 1, "only axis 0 and the last axis are sliced");
    slice_last_axis(data, shape, dtype_size, start, end)
}

/// Concatenate row-major blocks along their last axis
///
/// All blocks must share every dimension except the last.
pub fn concat_last_axis(blocks: &[(&[u8], usize)], outer: usize, dtype_size: usize) -> Vec<u8> {
    let total_cols: usize = blocks.iter().map(|(_, cols)| cols).sum();
    let mut result = Vec::with_capacity(outer * total_cols * dtype_size);

    for row in 0..outer {
        for (data, cols) in blocks {
            let row_bytes = cols * dtype_size;
            result.extend_from_slice(&data[row * row_bytes..(row + 1) * row_bytes]);
        }
    }

    result
}

/// Split a weight into its per-rank shards
///
/// `Replicate` yields a single tensor whatever the factor; every other
/// strategy yields exactly `factor` shards in rank order.
pub fn split(
    tensor: NamedTensor,
    strategy: ParallelismStrategy,
    factor: usize,
    heads: AttentionHeads,
) -> Result<Vec<NamedTensor>> {
    if factor == 0 {
        return Err(CoreError::InvalidConfig("shard factor must be at least 1".to_string()));
    }

    match strategy {
        ParallelismStrategy::Replicate => Ok(vec![tensor]),
        ParallelismStrategy::SplitRows => split_along(tensor, 0, factor),
        ParallelismStrategy::SplitColumns => {
            let last = tensor.shape().len().saturating_sub(1);
            split_along(tensor, last, factor)
        }
        ParallelismStrategy::FusedAttentionSplit => split_fused_qkv(tensor, factor, heads),
    }
}

fn split_along(tensor: NamedTensor, dim: usize, factor: usize) -> Result<Vec<NamedTensor>> {
    let dims = tensor.shape();
    if dims.is_empty() {
        return Err(CoreError::shape(&tensor.name, "cannot split a scalar"));
    }
    if dims[dim] % factor != 0 {
        return Err(CoreError::shape(
            &tensor.name,
            format!(
                "axis {} of length {} is not divisible by shard factor {}",
                dim, dims[dim], factor
            ),
        ));
    }
    if factor == 1 {
        return Ok(vec![tensor]);
    }

    let elem = tensor.dtype().size_bytes();
    let mut shard_shape = dims.to_vec();
    shard_shape[dim] /= factor;

    (0..factor)
        .map(|rank| {
            let data = slice_tensor_data(tensor.as_bytes(), tensor.shape(), elem, dim, rank, factor);
            NamedTensor::new(tensor.name.clone(), shard_shape.clone(), tensor.dtype(), data)
        })
        .collect()
}

fn split_fused_qkv(tensor: NamedTensor, factor: usize, heads: AttentionHeads) -> Result<Vec<NamedTensor>> {
    let name = tensor.name.clone();
    if tensor.shape().is_empty() {
        return Err(CoreError::shape(&name, "fused QKV weight cannot be a scalar"));
    }

    let (outer, total_cols) = shape::outer_inner(tensor.shape());
    let layout = AttentionHeadLayout::for_fused_width(&name, heads, total_cols)?;
    let q_cols = layout.query_columns();
    let kv_cols = layout.key_value_columns();

    // Every rank must hold whole heads, whatever the column counts allow
    for (block, count) in [
        ("attention", heads.num_attention_heads),
        ("key/value", heads.num_key_value_heads),
    ] {
        if count % factor != 0 {
            return Err(CoreError::shape(
                &name,
                format!("{} {} heads cannot be divided among {} ranks", count, block, factor),
            ));
        }
    }

    for (block, cols) in [("query", q_cols), ("key/value", kv_cols)] {
        if cols % factor != 0 {
            return Err(CoreError::shape(
                &name,
                format!(
                    "{} block of {} columns is not divisible by shard factor {}",
                    block, cols, factor
                ),
            ));
        }
    }

    let elem = tensor.dtype().size_bytes();
    let data = tensor.as_bytes();
    let dims = tensor.shape();

    // Block boundaries along the last axis: [0, q) [q, q+kv) [q+kv, total)
    let blocks = [(0, q_cols), (q_cols, q_cols + kv_cols), (q_cols + kv_cols, total_cols)];
    let block_data: Vec<(Vec<usize>, Vec<u8>)> = blocks
        .iter()
        .map(|&(start, end)| {
            let mut block_shape = dims.to_vec();
            block_shape[dims.len() - 1] = end - start;
            (block_shape, slice_last_axis(data, dims, elem, start, end))
        })
        .collect();

    let q_shard = q_cols / factor;
    let kv_shard = kv_cols / factor;
    let mut shard_shape = dims.to_vec();
    shard_shape[dims.len() - 1] = q_shard + 2 * kv_shard;

    (0..factor)
        .map(|rank| {
            let slices: Vec<Vec<u8>> = block_data
                .iter()
                .map(|(block_shape, bytes)| {
                    let last = block_shape.len() - 1;
                    slice_tensor_data(bytes, block_shape, elem, last, rank, factor)
                })
                .collect();
            let fused = concat_last_axis(
                &[
                    (slices[0].as_slice(), q_shard),
                    (slices[1].as_slice(), kv_shard),
                    (slices[2].as_slice(), kv_shard),
                ],
                outer,
                elem,
            );
            NamedTensor::new(name.clone(), shard_shape.clone(), tensor.dtype(), fused)
        })
        .collect()
}
