//! Model sources: where named tensors and hyperparameters come from

use shardconv_core::NamedTensor;

use crate::config::ModelHyperparameters;
use crate::error::{ModelError, Result};

/// A loaded checkpoint
///
/// Tensors are fetched one at a time so a conversion only holds the weights
/// currently being processed. Implementations are shared between worker
/// threads.
pub trait ModelSource: Send + Sync {
    /// Names of every tensor in the checkpoint, in a stable order
    fn tensor_names(&self) -> Vec<String>;

    /// Load one tensor by name
    fn load_tensor(&self, name: &str) -> Result<NamedTensor>;

    fn hyperparameters(&self) -> &ModelHyperparameters;

    /// Load every tensor eagerly
    fn list_named_tensors(&self) -> Result<Vec<NamedTensor>> {
        self.tensor_names()
            .iter()
            .map(|name| self.load_tensor(name))
            .collect()
    }
}

/// Source backed by tensors already in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    hyperparameters: ModelHyperparameters,
    tensors: Vec<NamedTensor>,
}

impl InMemorySource {
    pub fn new(hyperparameters: ModelHyperparameters, tensors: Vec<NamedTensor>) -> Self {
        Self {
            hyperparameters,
            tensors,
        }
    }

    pub fn push(&mut self, tensor: NamedTensor) {
        self.tensors.push(tensor);
    }
}

impl ModelSource for InMemorySource {
    fn tensor_names(&self) -> Vec<String> {
        self.tensors.iter().map(|t| t.name.clone()).collect()
    }

    fn load_tensor(&self, name: &str) -> Result<NamedTensor> {
        self.tensors
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))
    }

    fn hyperparameters(&self) -> &ModelHyperparameters {
        &self.hyperparameters
    }
}
