//! Result Aggregator
//!
//! Merges subtask results in ordinal order, dropping semantically identical
//! outputs (the lowest ordinal wins) and carrying sanitize flags through.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::task::{SubtaskId, SubtaskResult};

/// Separator placed between entries in the combined output
pub const OUTPUT_SEPARATOR: &str = "\n\n---\n\n";

/// How two results are judged identical
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Keep every result
    Off,
    /// Byte-for-byte equal
    Exact,
    /// Equal after case folding and whitespace collapsing
    #[default]
    Normalized,
    /// Word-set Jaccard similarity at or above `threshold`
    Similarity { threshold: f64 },
}

/// A kept result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub ordinal: usize,
    pub subtask_id: SubtaskId,
    pub content: String,
    /// Input or output was rewritten by the gate
    pub sanitized: bool,
    #[serde(default)]
    pub sanitize_notes: Vec<String>,
    pub tokens_used: u64,
    pub attempts: u32,
}

/// A result dropped as a duplicate of a kept entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub ordinal: usize,
    pub kept_ordinal: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Ordered by ordinal
    pub entries: Vec<AggregateEntry>,
    pub duplicates: Vec<DuplicateRecord>,
    pub total_tokens: u64,
}

impl AggregateResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Kept entries joined with [`OUTPUT_SEPARATOR`]
    pub fn combined_output(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join(OUTPUT_SEPARATOR)
    }

    pub fn ordinals(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.ordinal).collect()
    }

    pub fn any_sanitized(&self) -> bool {
        self.entries.iter().any(|e| e.sanitized)
    }

    /// Number of results merged, kept or dropped
    pub fn merged_count(&self) -> usize {
        self.entries.len() + self.duplicates.len()
    }
}

/// Result aggregator for combining subtask results
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    policy: DedupPolicy,
}

impl ResultAggregator {
    pub fn new(policy: DedupPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DedupPolicy {
        self.policy
    }

    pub fn merge(&self, mut results: Vec<SubtaskResult>) -> AggregateResult {
        results.sort_by_key(|r| r.ordinal);

        let mut aggregate = AggregateResult::empty();
        let mut kept_keys: Vec<(usize, DedupKey)> = Vec::new();

        for result in results {
            aggregate.total_tokens += result.tokens_used;

            let key = DedupKey::new(self.policy, &result.content);
            if let Some(kept_ordinal) = kept_keys
                .iter()
                .find(|(_, kept)| kept.matches(&key, self.policy))
                .map(|(ordinal, _)| *ordinal)
            {
                aggregate.duplicates.push(DuplicateRecord {
                    ordinal: result.ordinal,
                    kept_ordinal,
                });
                continue;
            }

            kept_keys.push((result.ordinal, key));
            aggregate.entries.push(AggregateEntry {
                ordinal: result.ordinal,
                sanitized: result.sanitized(),
                subtask_id: result.subtask_id,
                content: result.content,
                sanitize_notes: result.sanitize_notes,
                tokens_used: result.tokens_used,
                attempts: result.attempts,
            });
        }

        aggregate
    }
}

enum DedupKey {
    None,
    Text(String),
    Words(HashSet<String>),
}

impl DedupKey {
    fn new(policy: DedupPolicy, content: &str) -> Self {
        match policy {
            DedupPolicy::Off => DedupKey::None,
            DedupPolicy::Exact => DedupKey::Text(content.to_string()),
            DedupPolicy::Normalized => DedupKey::Text(normalize(content)),
            DedupPolicy::Similarity { .. } => DedupKey::Words(
                content
                    .split_whitespace()
                    .map(|w| {
                        w.trim_matches(|c: char| !c.is_alphanumeric())
                            .to_lowercase()
                    })
                    .filter(|w| !w.is_empty())
                    .collect(),
            ),
        }
    }

    fn matches(&self, other: &DedupKey, policy: DedupPolicy) -> bool {
        match (self, other, policy) {
            (DedupKey::Text(a), DedupKey::Text(b), _) => a == b,
            (DedupKey::Words(a), DedupKey::Words(b), DedupPolicy::Similarity { threshold }) => {
                jaccard(a, b) >= threshold
            }
            _ => false,
        }
    }
}

/// Case-folded with runs of whitespace collapsed
pub fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(ordinal: usize, content: &str) -> SubtaskResult {
        SubtaskResult {
            subtask_id: SubtaskId::new(format!("s{ordinal}")),
            ordinal,
            content: content.to_string(),
            started_at: Utc::now(),
            duration_ms: 10,
            tokens_used: 5,
            attempts: 1,
            input_sanitized: false,
            output_sanitized: false,
            sanitize_notes: Vec::new(),
        }
    }

    #[test]
    fn test_merge_sorts_by_ordinal() {
        let aggregator = ResultAggregator::default();
        let merged = aggregator.merge(vec![result(2, "c"), result(0, "a"), result(1, "b")]);

        assert_eq!(merged.ordinals(), vec![0, 1, 2]);
        assert_eq!(merged.combined_output(), "a\n\n---\n\nb\n\n---\n\nc");
        assert_eq!(merged.total_tokens, 15);
    }

    #[test]
    fn test_normalized_dedup_keeps_lowest_ordinal() {
        let aggregator = ResultAggregator::new(DedupPolicy::Normalized);
        let merged = aggregator.merge(vec![
            result(3, "The  ANSWER is 42"),
            result(1, "the answer is 42"),
            result(2, "something else"),
        ]);

        assert_eq!(merged.ordinals(), vec![1, 2]);
        assert_eq!(
            merged.duplicates,
            vec![DuplicateRecord { ordinal: 3, kept_ordinal: 1 }]
        );
        assert_eq!(merged.merged_count(), 3);
    }

    #[test]
    fn test_exact_and_off_policies() {
        let inputs = || vec![result(0, "Same"), result(1, "same"), result(2, "Same")];

        let exact = ResultAggregator::new(DedupPolicy::Exact).merge(inputs());
        assert_eq!(exact.ordinals(), vec![0, 1]);

        let off = ResultAggregator::new(DedupPolicy::Off).merge(inputs());
        assert_eq!(off.ordinals(), vec![0, 1, 2]);
        assert!(off.duplicates.is_empty());
    }

    #[test]
    fn test_similarity_threshold() {
        let near = vec![
            result(0, "The build failed because the linker ran out of memory."),
            result(1, "the build failed because the linker ran out of memory"),
            result(2, "The build failed because the compiler ran out of memory."),
        ];

        let strict = ResultAggregator::new(DedupPolicy::Similarity { threshold: 1.0 }).merge(near.clone());
        assert_eq!(strict.ordinals(), vec![0, 2]);

        let loose = ResultAggregator::new(DedupPolicy::Similarity { threshold: 0.7 }).merge(near);
        assert_eq!(loose.ordinals(), vec![0]);
        assert_eq!(loose.duplicates.len(), 2);
    }

    #[test]
    fn test_sanitize_flags_carried() {
        let mut sanitized = result(0, "clean");
        sanitized.output_sanitized = true;
        sanitized.sanitize_notes = vec!["credential-token: 1 match(es) redacted".to_string()];

        let merged = ResultAggregator::default().merge(vec![sanitized, result(1, "other")]);
        assert!(merged.entries[0].sanitized);
        assert!(!merged.entries[1].sanitized);
        assert!(merged.any_sanitized());
        assert_eq!(merged.entries[0].sanitize_notes.len(), 1);
    }

    #[test]
    fn test_merge_empty() {
        let merged = ResultAggregator::default().merge(Vec::new());
        assert!(merged.is_empty());
        assert_eq!(merged.combined_output(), "");
    }
}
