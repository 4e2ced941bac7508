//! Structural anomaly checks: payload length, nesting depth and repetition

use std::collections::HashMap;

use super::{Direction, ScreeningPolicy, SecurityVerdict};
use crate::config::GateConfig;

#[derive(Debug, Clone)]
pub struct StructuralPolicy {
    max_input_chars: usize,
    max_output_chars: usize,
    max_nesting_depth: usize,
    repetition_window: usize,
    max_repetition_ratio: f64,
    min_repetition_sample: usize,
}

impl StructuralPolicy {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            max_input_chars: config.max_input_chars,
            max_output_chars: config.max_output_chars,
            max_nesting_depth: config.max_nesting_depth,
            repetition_window: config.repetition_window.max(1),
            max_repetition_ratio: config.max_repetition_ratio,
            min_repetition_sample: config.min_repetition_sample,
        }
    }

    fn check_nesting(&self, payload: &str) -> Option<String> {
        let depth = nesting_depth(payload);
        (depth > self.max_nesting_depth).then(|| {
            format!("nesting depth {} exceeds {}", depth, self.max_nesting_depth)
        })
    }

    fn check_repetition(&self, payload: &str) -> Option<String> {
        let ratio = repetition_ratio(payload, self.repetition_window, self.min_repetition_sample)?;
        (ratio > self.max_repetition_ratio).then(|| {
            format!(
                "repetition ratio {:.2} exceeds {:.2}",
                ratio, self.max_repetition_ratio
            )
        })
    }
}

impl Default for StructuralPolicy {
    fn default() -> Self {
        Self::from_config(&GateConfig::default())
    }
}

impl ScreeningPolicy for StructuralPolicy {
    fn name(&self) -> &str {
        "structural"
    }

    fn screen(&self, payload: &str, direction: Direction) -> SecurityVerdict {
        let length = payload.chars().count();
        let mut truncated = None;

        match direction {
            Direction::Input if length > self.max_input_chars => {
                return SecurityVerdict::Deny {
                    reason: format!(
                        "payload length {} exceeds {}",
                        length, self.max_input_chars
                    ),
                };
            }
            Direction::Output if length > self.max_output_chars => {
                truncated = Some(truncate_at_word(payload, self.max_output_chars).to_string());
            }
            _ => {}
        }

        let text = truncated.as_deref().unwrap_or(payload);

        if let Some(reason) = self
            .check_nesting(text)
            .or_else(|| self.check_repetition(text))
        {
            return SecurityVerdict::Deny { reason };
        }

        match truncated {
            Some(payload) => SecurityVerdict::Sanitize {
                payload,
                notes: vec![format!(
                    "structural: output truncated from {} to {} characters",
                    length, self.max_output_chars
                )],
            },
            None => SecurityVerdict::Allow,
        }
    }
}

/// At most `max_chars` characters, cut at the last whitespace so that
/// a word or an earlier redaction marker is never split
///
/// Falls back to a hard cut when the kept part has no whitespace.
pub fn truncate_at_word(payload: &str, max_chars: usize) -> &str {
    let Some((cut, next)) = payload.char_indices().nth(max_chars) else {
        return payload;
    };
    let head = &payload[..cut];
    if next.is_whitespace() {
        return head.trim_end();
    }
    match head.rfind(char::is_whitespace) {
        Some(boundary) => head[..boundary].trim_end(),
        None => head,
    }
}

/// Deepest bracket nesting; unbalanced closers are ignored
pub fn nesting_depth(payload: &str) -> usize {
    let mut depth: usize = 0;
    let mut max_depth = 0;

    for c in payload.chars() {
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    max_depth
}

/// Share of word shingles that repeat an earlier shingle
///
/// Returns `None` when the payload has fewer than `min_sample` shingles.
pub fn repetition_ratio(payload: &str, window: usize, min_sample: usize) -> Option<f64> {
    let words: Vec<String> = payload
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();

    if words.len() < window {
        return None;
    }

    let mut counts: HashMap<&[String], usize> = HashMap::new();
    for shingle in words.windows(window) {
        *counts.entry(shingle).or_insert(0) += 1;
    }

    let total = words.len() - window + 1;
    if total < min_sample {
        return None;
    }

    Some(1.0 - counts.len() as f64 / total as f64)
}
