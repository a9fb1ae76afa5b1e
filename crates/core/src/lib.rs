//! ShardConv Core - tensor-parallel sharding rules
//!
//! This crate holds the pure part of the converter:
//! - Host tensors with dtype casts and 2-D transposes
//! - The weight-name classifier that picks a parallelism strategy
//! - Query/key/value fusion
//! - The shard splitter, including GQA-aware fused QKV splitting
//!
//! # Sharding
//!
//! | Weight | Strategy |
//! |--------|----------|
//! | layer norms, output bias | replicate (rank 0 only) |
//! | `mlp.{gate,up,down}_proj` | split axis 0 |
//! | `attention.query_key_value` | fused QKV split |
//! | `attention.dense` | split axis 0 |

pub mod error;
pub mod fuse;
pub mod layout;
pub mod parallel;
pub mod tensor;

pub use error::{CoreError, Result};
pub use fuse::{fuse_qkv, to_in_out, ProjectionLayout};
pub use layout::{AttentionHeadLayout, AttentionHeads};
pub use parallel::{classify, split, ParallelismStrategy, WEIGHT_PATTERNS};
pub use tensor::{DType, NamedTensor};
