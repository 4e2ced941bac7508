//! Regex screening rules

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Direction, ScreeningPolicy, SecurityVerdict};
use crate::config::PatternRuleConfig;
use crate::{Error, Result};

/// What happens when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Reject the payload
    Deny,
    /// Replace every match and let the payload through
    Redact,
}

/// Which direction a rule screens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Input,
    Output,
    #[default]
    Both,
}

impl RuleScope {
    fn covers(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (RuleScope::Both, _)
                | (RuleScope::Input, Direction::Input)
                | (RuleScope::Output, Direction::Output)
        )
    }
}

#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    regex: Regex,
    action: RuleAction,
    applies_to: RuleScope,
    replacement: String,
}

impl PatternRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        action: RuleAction,
        applies_to: RuleScope,
    ) -> Result<Self> {
        let name = name.into();
        let regex = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("Invalid pattern for rule '{}': {}", name, e)))?;

        Ok(Self {
            name,
            regex,
            action,
            applies_to,
            replacement: String::new(),
        })
    }

    pub fn with_replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }

    pub fn from_config(config: &PatternRuleConfig) -> Result<Self> {
        let rule = Self::new(&config.name, &config.pattern, config.action, config.applies_to)?;
        Ok(match &config.replacement {
            Some(replacement) => rule.with_replacement(replacement),
            None if config.action == RuleAction::Redact => rule.with_replacement("[REDACTED]"),
            None => rule,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> RuleAction {
        self.action
    }
}

/// Built-in rules: prompt-injection phrases deny, terminal/invisible
/// characters and credential-looking tokens are redacted
pub fn builtin_rules() -> Result<Vec<PatternRule>> {
    Ok(vec![
        PatternRule::new("ansi-escape", r"\x1b\[[0-9;?]*[ -/]*[@-~]", RuleAction::Redact, RuleScope::Both)?,
        PatternRule::new(
            "control-characters",
            r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]",
            RuleAction::Redact,
            RuleScope::Both,
        )?,
        PatternRule::new(
            "zero-width-characters",
            r"[\x{200B}-\x{200D}\x{2060}\x{FEFF}]",
            RuleAction::Redact,
            RuleScope::Both,
        )?,
        PatternRule::new(
            "credential-token",
            r"\b(?:sk|pk|rk)-[A-Za-z0-9_\-]{16,}|\bAKIA[0-9A-Z]{16}\b",
            RuleAction::Redact,
            RuleScope::Output,
        )?
        .with_replacement("[REDACTED]"),
        PatternRule::new(
            "instruction-override",
            r"(?i)\b(?:ignore|disregard|forget)\s+(?:all\s+|any\s+)?(?:of\s+)?(?:the\s+|your\s+)?(?:previous|prior|above|earlier|preceding)\s+(?:instructions|prompts|rules|directions)",
            RuleAction::Deny,
            RuleScope::Input,
        )?,
        PatternRule::new(
            "system-prompt-exfiltration",
            r"(?i)\b(?:reveal|print|show|repeat|leak|output)\s+(?:me\s+)?(?:your|the)\s+(?:system|hidden|initial|original)\s+(?:prompt|instructions)",
            RuleAction::Deny,
            RuleScope::Input,
        )?,
        PatternRule::new(
            "mode-override",
            r"(?i)\b(?:you\s+are\s+now\s+in|enable|enter|activate|switch\s+to)\s+(?:developer|jailbreak|dan|god)\s+mode\b",
            RuleAction::Deny,
            RuleScope::Input,
        )?,
    ])
}

/// Regex rules applied in two passes: redactions first, then denials
/// against the redacted text so invisible characters cannot split a
/// deny phrase
#[derive(Debug, Clone, Default)]
pub struct PatternPolicy {
    rules: Vec<PatternRule>,
}

impl PatternPolicy {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    pub fn builtin() -> Result<Self> {
        Ok(Self::new(builtin_rules()?))
    }

    pub fn with_rule(mut self, rule: PatternRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }
}

impl ScreeningPolicy for PatternPolicy {
    fn name(&self) -> &str {
        "patterns"
    }

    fn screen(&self, payload: &str, direction: Direction) -> SecurityVerdict {
        let mut text = payload.to_string();
        let mut notes = Vec::new();

        for rule in self
            .rules
            .iter()
            .filter(|r| r.action == RuleAction::Redact && r.applies_to.covers(direction))
        {
            let count = rule.regex.find_iter(&text).count();
            if count > 0 {
                text = rule
                    .regex
                    .replace_all(&text, rule.replacement.as_str())
                    .into_owned();
                notes.push(format!("{}: {} match(es) redacted", rule.name, count));
            }
        }

        for rule in self
            .rules
            .iter()
            .filter(|r| r.action == RuleAction::Deny && r.applies_to.covers(direction))
        {
            if rule.regex.is_match(&text) {
                return SecurityVerdict::Deny {
                    reason: format!("matched rule '{}'", rule.name),
                };
            }
        }

        if notes.is_empty() {
            SecurityVerdict::Allow
        } else {
            SecurityVerdict::Sanitize { payload: text, notes }
        }
    }
}
