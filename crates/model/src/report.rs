//! Outcome of a conversion run

use std::collections::BTreeMap;
use std::time::Duration;

use shardconv_core::ParallelismStrategy;

use crate::error::FailureKind;
use crate::writer::WrittenShard;

/// A weight whose shards were all written
#[derive(Debug, Clone)]
pub struct WrittenWeight {
    /// Name in the sharded layout
    pub name: String,
    /// `None` for whole-tensor writes (embedding, final norm, output head)
    pub strategy: Option<ParallelismStrategy>,
    pub shards: Vec<WrittenShard>,
}

impl WrittenWeight {
    pub fn bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.bytes).sum()
    }
}

/// A weight that produced no output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedWeight {
    /// Checkpoint name of the weight
    pub name: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    pub written: Vec<WrittenWeight>,
    pub skipped: Vec<SkippedWeight>,
    pub elapsed: Duration,
}

impl ConversionReport {
    pub fn weights_written(&self) -> usize {
        self.written.len()
    }

    pub fn files_written(&self) -> usize {
        self.written.iter().map(|w| w.shards.len()).sum()
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.iter().map(WrittenWeight::bytes).sum()
    }

    /// True when no weight was skipped
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn count_by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            *counts.entry(skipped.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn find_written(&self, name: &str) -> Option<&WrittenWeight> {
        self.written.iter().find(|w| w.name == name)
    }

    pub fn log_summary(&self) {
        tracing::info!(
            "Converted {} weights into {} files ({:.2} GB) in {:.1}s",
            self.weights_written(),
            self.files_written(),
            self.bytes_written() as f64 / (1024.0 * 1024.0 * 1024.0),
            self.elapsed.as_secs_f32()
        );

        if self.is_complete() {
            return;
        }

        let by_kind: Vec<String> = self
            .count_by_kind()
            .iter()
            .map(|(kind, n)| format!("{}={}", kind, n))
            .collect();
        tracing::warn!("Skipped {} weights ({})", self.skipped.len(), by_kind.join(", "));
        for skipped in &self.skipped {
            tracing::warn!("  {} [{}]: {}", skipped.name, skipped.kind, skipped.reason);
        }
    }
}
