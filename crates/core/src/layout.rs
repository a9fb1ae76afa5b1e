//! Attention head layout for fused QKV projections
//!
//! A fused projection stores query, key and value columns side by side:
//!
//! ```text
//! | query: H * S | key: K * S | value: K * S |
//! ```
//!
//! where `H` is the number of attention heads, `K` the number of key/value
//! heads and `S` the head size. `K < H` is grouped-query attention, `K == H`
//! is standard multi-head attention.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Head counts declared by the model configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionHeads {
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
}

impl AttentionHeads {
    pub fn new(num_attention_heads: usize, num_key_value_heads: usize) -> Self {
        Self {
            num_attention_heads,
            num_key_value_heads,
        }
    }

    /// Multi-head attention: one key/value head per query head
    pub fn mha(num_heads: usize) -> Self {
        Self::new(num_heads, num_heads)
    }

    /// Number of query heads sharing each key/value head
    pub fn num_kv_groups(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads.max(1)
    }
}

/// Resolved column layout of a fused QKV projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionHeadLayout {
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_size: usize,
}

impl AttentionHeadLayout {
    pub fn new(num_attention_heads: usize, num_key_value_heads: usize, head_size: usize) -> Result<Self> {
        if num_attention_heads == 0 || num_key_value_heads == 0 || head_size == 0 {
            return Err(CoreError::InvalidConfig(format!(
                "head layout needs positive values, got heads={} kv_heads={} head_size={}",
                num_attention_heads, num_key_value_heads, head_size
            )));
        }
        if num_key_value_heads > num_attention_heads {
            return Err(CoreError::InvalidConfig(format!(
                "num_key_value_heads ({}) exceeds num_attention_heads ({})",
                num_key_value_heads, num_attention_heads
            )));
        }
        Ok(Self {
            num_attention_heads,
            num_key_value_heads,
            head_size,
        })
    }

    /// Derive the layout of a fused tensor from its total column count
    ///
    /// `head_size = total_columns / (H + 2K)`; the width must satisfy the
    /// identity exactly.
    pub fn for_fused_width(name: &str, heads: AttentionHeads, total_columns: usize) -> Result<Self> {
        let AttentionHeads {
            num_attention_heads: h,
            num_key_value_heads: k,
        } = heads;
        if k > h {
            return Err(CoreError::shape(
                name,
                format!("num_key_value_heads ({}) exceeds num_attention_heads ({})", k, h),
            ));
        }
        let units = h + 2 * k;
        if h == 0 || k == 0 || total_columns % units != 0 || total_columns < units {
            return Err(CoreError::shape(
                name,
                format!(
                    "fused width {} is not head_size * (heads {} + 2 * kv_heads {})",
                    total_columns, h, k
                ),
            ));
        }
        Self::new(h, k, total_columns / units).map_err(|e| CoreError::shape(name, e.to_string()))
    }

    pub fn query_columns(&self) -> usize {
        self.num_attention_heads * self.head_size
    }

    pub fn key_value_columns(&self) -> usize {
        self.num_key_value_heads * self.head_size
    }

    pub fn total_columns(&self) -> usize {
        self.query_columns() + 2 * self.key_value_columns()
    }

    pub fn heads(&self) -> AttentionHeads {
        AttentionHeads::new(self.num_attention_heads, self.num_key_value_heads)
    }
}
