//! Host tensor types used throughout the conversion pipeline

use std::fmt;
use std::str::FromStr;

use half::{bf16, f16};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "fp32")]
    F32,
    #[serde(rename = "fp16")]
    F16,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "int8")]
    I8,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 => 1,
        }
    }

    /// Tag used on the command line and in `config.ini`
    pub fn tag(&self) -> &'static str {
        match self {
            DType::F32 => "fp32",
            DType::F16 => "fp16",
            DType::BF16 => "bf16",
            DType::I8 => "int8",
        }
    }

    pub fn is_float(&self) -> bool {
        !matches!(self, DType::I8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for DType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(DType::F32),
            "fp16" | "f16" | "float16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "int8" | "i8" => Ok(DType::I8),
            _ => Err(CoreError::InvalidDType(s.to_string())),
        }
    }
}

/// A named, owned, row-major tensor
///
/// The buffer holds little-endian elements of `dtype`; its length always
/// equals `numel() * dtype.size_bytes()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTensor {
    pub name: String,
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl NamedTensor {
    /// Create a tensor, checking the buffer against the shape
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let name = name.into();
        if shape.iter().any(|&d| d == 0) {
            return Err(CoreError::shape(&name, format!("zero-sized dimension in {:?}", shape)));
        }
        let expected = shape::numel(&shape) * dtype.size_bytes();
        if data.len() != expected {
            return Err(CoreError::shape(
                &name,
                format!(
                    "buffer holds {} bytes, shape {:?} of {} needs {}",
                    data.len(),
                    shape,
                    dtype,
                    expected
                ),
            ));
        }
        Ok(Self { name, shape, dtype, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        shape::numel(&self.shape)
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_parts(self) -> (String, Vec<usize>, DType, Vec<u8>) {
        (self.name, self.shape, self.dtype, self.data)
    }

    /// Rename in place, keeping shape and data
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Swap the two axes of a 2-D tensor: (rows x cols) -> (cols x rows)
    pub fn transpose_2d(self) -> Result<Self> {
        if self.shape.len() != 2 {
            return Err(CoreError::shape(
                &self.name,
                format!("transpose needs a 2-D tensor, got shape {:?}", self.shape),
            ));
        }
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let elem = self.dtype.size_bytes();
        let mut out = vec![0u8; self.data.len()];

        // Each output row gathers one source column
        out.par_chunks_exact_mut(rows * elem)
            .enumerate()
            .for_each(|(c, dst_row)| {
                for r in 0..rows {
                    let src = (r * cols + c) * elem;
                    dst_row[r * elem..(r + 1) * elem].copy_from_slice(&self.data[src..src + elem]);
                }
            });

        Ok(Self {
            name: self.name,
            shape: vec![cols, rows],
            dtype: self.dtype,
            data: out,
        })
    }

    /// Convert the elements to `target`
    ///
    /// Float formats convert freely through f32; int8 can be widened to a
    /// float format but nothing narrows into int8.
    pub fn cast(self, target: DType) -> Result<Self> {
        if self.dtype == target {
            return Ok(self);
        }
        if !target.is_float() {
            return Err(CoreError::UnsupportedCast {
                name: self.name,
                from: self.dtype,
                to: target,
            });
        }

        let src_size = self.dtype.size_bytes();
        let dst_size = target.size_bytes();
        let src_dtype = self.dtype;
        let mut out = vec![0u8; self.numel() * dst_size];

        out.par_chunks_exact_mut(dst_size)
            .zip(self.data.par_chunks_exact(src_size))
            .for_each(|(dst, src)| encode_f32(decode_f32(src, src_dtype), target, dst));

        Ok(Self {
            name: self.name,
            shape: self.shape,
            dtype: target,
            data: out,
        })
    }
}

fn decode_f32(bytes: &[u8], dtype: DType) -> f32 {
    match dtype {
        DType::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        DType::F16 => f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f32(),
        DType::BF16 => bf16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]])).to_f32(),
        DType::I8 => bytes[0] as i8 as f32,
    }
}

fn encode_f32(value: f32, dtype: DType, out: &mut [u8]) {
    match dtype {
        DType::F32 => out.copy_from_slice(&value.to_le_bytes()),
        DType::F16 => out.copy_from_slice(&f16::from_f32(value).to_bits().to_le_bytes()),
        DType::BF16 => out.copy_from_slice(&bf16::from_f32(value).to_bits().to_le_bytes()),
        DType::I8 => unreachable!("int8 is never a cast target"),
    }
}

/// Tensor shape utilities
pub mod shape {
    /// Calculate the product of dimensions
    pub fn numel(shape: &[usize]) -> usize {
        shape.iter().product()
    }

    /// Split a shape into (elements before the last axis, last axis length)
    pub fn outer_inner(shape: &[usize]) -> (usize, usize) {
        match shape.split_last() {
            Some((&last, outer)) => (numel(outer), last),
            None => (1, 1),
        }
    }
}
