//! Query/key/value fusion
//!
//! Checkpoints store linear layers as `[out_features, in_features]`. The
//! sharded format wants `[in_features, out_features]` with the three attention
//! projections side by side in the order query, key, value.

use crate::error::{CoreError, Result};
use crate::parallel::concat_last_axis;
use crate::tensor::NamedTensor;

/// Orientation of a 2-D projection weight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionLayout {
    /// `[out_features, in_features]`, as stored by linear layers
    OutIn,
    /// `[in_features, out_features]`
    InOut,
}

/// Decide the orientation of a q/k/v triple from the axis they share
///
/// When both axes agree (square multi-head projections) the linear-layer
/// layout is assumed.
pub fn detect_qkv_layout(query: &NamedTensor, key: &NamedTensor, value: &NamedTensor) -> Result<ProjectionLayout> {
    for t in [query, key, value] {
        if t.shape().len() != 2 {
            return Err(CoreError::Shape {
                name: t.name.clone(),
                detail: format!("attention projection must be 2-D, got {:?}", t.shape()),
            });
        }
    }

    let (q, k, v) = (query.shape(), key.shape(), value.shape());
    if q[1] == k[1] && k[1] == v[1] {
        Ok(ProjectionLayout::OutIn)
    } else if q[0] == k[0] && k[0] == v[0] {
        Ok(ProjectionLayout::InOut)
    } else {
        Err(CoreError::Shape {
            name: query.name.clone(),
            detail: format!(
                "query {:?}, key {:?} and value {:?} share no input-feature axis",
                q, k, v
            ),
        })
    }
}

/// Fuse separate q/k/v projections into one `[in, q + k + v]` tensor
///
/// The result takes the query's name; callers rename it to the fused weight
/// name.
pub fn fuse_qkv(query: NamedTensor, key: NamedTensor, value: NamedTensor) -> Result<NamedTensor> {
    let dtype = query.dtype();
    for t in [&key, &value] {
        if t.dtype() != dtype {
            return Err(CoreError::Shape {
                name: t.name.clone(),
                detail: format!("dtype {} differs from query dtype {}", t.dtype(), dtype),
            });
        }
    }

    let (query, key, value) = match detect_qkv_layout(&query, &key, &value)? {
        ProjectionLayout::OutIn => (query.transpose_2d()?, key.transpose_2d()?, value.transpose_2d()?),
        ProjectionLayout::InOut => (query, key, value),
    };

    let in_features = query.shape()[0];
    let (q_cols, k_cols, v_cols) = (query.shape()[1], key.shape()[1], value.shape()[1]);
    let data = concat_last_axis(
        &[
            (query.as_bytes(), q_cols),
            (key.as_bytes(), k_cols),
            (value.as_bytes(), v_cols),
        ],
        in_features,
        dtype.size_bytes(),
    );

    NamedTensor::new(query.name.clone(), vec![in_features, q_cols + k_cols + v_cols], dtype, data)
}

/// Transpose a 2-D linear weight to `[in, out]`; other ranks pass through
pub fn to_in_out(tensor: NamedTensor) -> Result<NamedTensor> {
    if tensor.shape().len() == 2 {
        tensor.transpose_2d()
    } else {
        Ok(tensor)
    }
}
