//! Task decomposition policies
//!
//! A decomposer turns a task into ordered instruction fragments. The
//! coordinator assigns ordinals in the order returned.

use crate::task::Task;

/// Splits a task into worker instructions
pub trait Decomposer: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered fragments; empty when the task cannot be decomposed
    fn decompose(&self, task: &Task) -> Vec<String>;
}

/// The whole instruction as a single subtask
#[derive(Debug, Clone, Copy, Default)]
pub struct WholeTask;

impl Decomposer for WholeTask {
    fn name(&self) -> &str {
        "whole"
    }

    fn decompose(&self, task: &Task) -> Vec<String> {
        if task.instruction.trim().is_empty() {
            return Vec::new();
        }
        vec![task.instruction.clone()]
    }
}

/// One subtask per scope partition, e.g. a chat or a search scope
///
/// Each fragment is `"<partition>: <instruction>"`. A task without
/// partitions runs whole.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionSplit;

impl Decomposer for PartitionSplit {
    fn name(&self) -> &str {
        "partition"
    }

    fn decompose(&self, task: &Task) -> Vec<String> {
        if task.instruction.trim().is_empty() {
            return Vec::new();
        }
        if task.scope.partitions.is_empty() {
            return WholeTask.decompose(task);
        }

        task.scope
            .partitions
            .iter()
            .map(|partition| format!("{}: {}", partition, task.instruction))
            .collect()
    }
}

/// Divides the task context evenly between `parts` workers
#[derive(Debug, Clone, Copy)]
pub struct ChunkSplit {
    pub parts: usize,
}

impl ChunkSplit {
    pub fn new(parts: usize) -> Self {
        Self { parts: parts.max(1) }
    }
}

impl Decomposer for ChunkSplit {
    fn name(&self) -> &str {
        "chunk"
    }

    fn decompose(&self, task: &Task) -> Vec<String> {
        if task.instruction.trim().is_empty() {
            return Vec::new();
        }
        if task.context.is_empty() || self.parts <= 1 {
            let mut whole = task.instruction.clone();
            for item in &task.context {
                whole.push_str("\n\n");
                whole.push_str(item);
            }
            return vec![whole];
        }

        let per_part = task.context.len().div_ceil(self.parts);
        task.context
            .chunks(per_part)
            .enumerate()
            .map(|(i, chunk)| {
                let parts = task.context.len().div_ceil(per_part);
                format!(
                    "Part {} of {}: {}\n\n{}",
                    i + 1,
                    parts,
                    task.instruction,
                    chunk.join("\n\n")
                )
            })
            .collect()
    }
}
