//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. swarm.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。
//! 読み込んだ設定は不変の値として Governor に渡され、各タスクツリーは
//! そこから自身の Budget を導出します。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::aggregator::DedupPolicy;
use crate::gate::{RuleAction, RuleScope};
use crate::recovery::BackoffPolicy;
use crate::Error;

/// Default config file looked up by [`SwarmConfig::load`]
pub const DEFAULT_CONFIG_FILE: &str = "swarm.toml";

/// LLM Provider type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Messages API
    #[default]
    Claude,
    /// OpenAI-compatible API (GLM, etc.)
    OpenAi,
}

impl LlmProvider {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "openai" | "glm" | "zai" | "minimax" => LlmProvider::OpenAi,
            _ => LlmProvider::Claude,
        }
    }
}

/// LLM backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// API provider
    #[serde(default)]
    pub provider: LlmProvider,

    /// Base URL (optional, for custom endpoints)
    pub base_url: Option<String>,

    /// System prompt sent with every worker request
    pub system_prompt: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            provider: LlmProvider::Claude,
            base_url: None,
            system_prompt: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Resource limits applied to every task tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum workers running at once in one task tree
    #[serde(default = "default_max_parallel_agents", alias = "maxParallelAgents")]
    pub max_parallel_agents: usize,

    /// Token budget shared by every subtask of a task tree
    #[serde(default = "default_max_tokens_per_context", alias = "maxTokensPerContext")]
    pub max_tokens_per_context: u64,

    /// Maximum nesting depth of task trees (the root task is depth 1)
    #[serde(default = "default_max_recursion_depth", alias = "maxRecursionDepth")]
    pub max_recursion_depth: u32,

    /// Wall-clock budget of a task tree in milliseconds
    #[serde(default = "default_context_timeout_ms", alias = "contextTimeoutMs")]
    pub context_timeout_ms: u64,

    /// Retries per subtask for timeouts and backend errors
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    /// Backend calls per second per task tree
    #[serde(default = "default_rate_limit_per_second", alias = "rateLimitPerSecond")]
    pub rate_limit_per_second: u32,

    /// Per-attempt deadline; defaults to the context timeout
    #[serde(default, alias = "subtaskTimeoutMs")]
    pub subtask_timeout_ms: Option<u64>,

    /// Tokens reserved per worker; defaults to an even share of the context budget
    #[serde(default, alias = "tokensPerSubtask")]
    pub tokens_per_subtask: Option<u64>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            max_tokens_per_context: default_max_tokens_per_context(),
            max_recursion_depth: default_max_recursion_depth(),
            context_timeout_ms: default_context_timeout_ms(),
            max_retries: default_max_retries(),
            rate_limit_per_second: default_rate_limit_per_second(),
            subtask_timeout_ms: None,
            tokens_per_subtask: None,
        }
    }
}

impl LimitsConfig {
    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn subtask_timeout(&self) -> Duration {
        Duration::from_millis(self.subtask_timeout_ms.unwrap_or(self.context_timeout_ms))
    }

    /// Tokens a single worker reserves before calling the backend
    pub fn tokens_per_subtask(&self) -> u64 {
        self.tokens_per_subtask.unwrap_or_else(|| {
            self.max_tokens_per_context / self.max_parallel_agents.max(1) as u64
        })
    }
}

/// Retry backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Growth factor between consecutive attempts
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// A screening rule supplied through configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternRuleConfig {
    pub name: String,
    /// Regular expression (regex crate syntax)
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default)]
    pub applies_to: RuleScope,
    /// Replacement text for `redact` rules
    pub replacement: Option<String>,
}

/// Security gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateConfig {
    /// Load the built-in prompt-injection and redaction rules
    #[serde(default = "default_true")]
    pub builtin_rules: bool,

    /// Inputs longer than this (in characters) are denied
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Outputs longer than this (in characters) are truncated
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Words per shingle in the repetition check
    #[serde(default = "default_repetition_window")]
    pub repetition_window: usize,

    /// Share of repeated shingles above which a payload is denied
    #[serde(default = "default_max_repetition_ratio")]
    pub max_repetition_ratio: f64,

    /// Payloads with fewer shingles skip the repetition check
    #[serde(default = "default_min_repetition_sample")]
    pub min_repetition_sample: usize,

    #[serde(default)]
    pub extra_rules: Vec<PatternRuleConfig>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            builtin_rules: true,
            max_input_chars: default_max_input_chars(),
            max_output_chars: default_max_output_chars(),
            max_nesting_depth: default_max_nesting_depth(),
            repetition_window: default_repetition_window(),
            max_repetition_ratio: default_max_repetition_ratio(),
            min_repetition_sample: default_min_repetition_sample(),
            extra_rules: Vec::new(),
        }
    }
}

/// Result aggregation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub dedup: DedupPolicy,
}

/// Main configuration for swarm
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_parallel_agents() -> usize {
    5
}

fn default_max_tokens_per_context() -> u64 {
    100_000
}

fn default_max_recursion_depth() -> u32 {
    10
}

fn default_context_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_rate_limit_per_second() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_max_input_chars() -> usize {
    32_000
}

fn default_max_output_chars() -> usize {
    64_000
}

fn default_max_nesting_depth() -> usize {
    32
}

fn default_repetition_window() -> usize {
    4
}

fn default_max_repetition_ratio() -> f64 {
    0.8
}

fn default_min_repetition_sample() -> usize {
    16
}

impl SwarmConfig {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 文字列から設定を構築する（環境変数による上書きなし）
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let toml: TomlConfig = toml::from_str(&expanded)?;
        Ok(Self::from_toml_config(toml))
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換され、
    /// その後 `SWARM_*` / `LLM_*` 環境変数で上書きされます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut cfg = Self::from_toml_str(&content)?;

        // 既存の環境変数で上書き（環境変数が優先）
        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `.env` を読み込んだ後、`./swarm.toml` があればそれを使い、
    /// 見つからない場合は環境変数とデフォルト値のみで構築します。
    pub fn load() -> crate::Result<Self> {
        dotenvy::dotenv().ok();

        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            return Self::from_toml_file(DEFAULT_CONFIG_FILE);
        }

        Self::from_env()
    }

    /// Load configuration from environment variables and defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// TOML 構造から SwarmConfig を構築
    fn from_toml_config(toml: TomlConfig) -> Self {
        let limits = toml.limits.unwrap_or_default();
        let limit_defaults = LimitsConfig::default();
        let limits = LimitsConfig {
            max_parallel_agents: limits
                .max_parallel_agents
                .unwrap_or(limit_defaults.max_parallel_agents),
            max_tokens_per_context: limits
                .max_tokens_per_context
                .unwrap_or(limit_defaults.max_tokens_per_context),
            max_recursion_depth: limits
                .max_recursion_depth
                .unwrap_or(limit_defaults.max_recursion_depth),
            context_timeout_ms: limits
                .context_timeout_ms
                .unwrap_or(limit_defaults.context_timeout_ms),
            max_retries: limits.max_retries.unwrap_or(limit_defaults.max_retries),
            rate_limit_per_second: limits
                .rate_limit_per_second
                .unwrap_or(limit_defaults.rate_limit_per_second),
            subtask_timeout_ms: limits.subtask_timeout_ms,
            tokens_per_subtask: limits.tokens_per_subtask,
        };

        let retry = toml.retry.unwrap_or_default();
        let retry = RetryConfig {
            initial_delay_ms: retry.initial_delay_ms.unwrap_or_else(default_initial_delay_ms),
            multiplier: retry.multiplier.unwrap_or_else(default_backoff_multiplier),
            max_delay_ms: retry.max_delay_ms.unwrap_or_else(default_max_delay_ms),
        };

        let gate = toml.gate.unwrap_or_default();
        let gate = GateConfig {
            builtin_rules: gate.builtin_rules.unwrap_or(true),
            max_input_chars: gate.max_input_chars.unwrap_or_else(default_max_input_chars),
            max_output_chars: gate.max_output_chars.unwrap_or_else(default_max_output_chars),
            max_nesting_depth: gate.max_nesting_depth.unwrap_or_else(default_max_nesting_depth),
            repetition_window: gate.repetition_window.unwrap_or_else(default_repetition_window),
            max_repetition_ratio: gate
                .max_repetition_ratio
                .unwrap_or_else(default_max_repetition_ratio),
            min_repetition_sample: gate
                .min_repetition_sample
                .unwrap_or_else(default_min_repetition_sample),
            extra_rules: gate.extra_rules.unwrap_or_default(),
        };

        let aggregator = toml.aggregator.unwrap_or_default();
        let aggregator = AggregatorConfig {
            dedup: aggregator.dedup.unwrap_or_default(),
        };

        let llm = toml.llm.unwrap_or_default();
        let llm = LlmConfig {
            api_key: llm.api_key.unwrap_or_default(),
            model: llm.model.unwrap_or_else(default_model),
            provider: LlmProvider::parse(&llm.provider.unwrap_or_default()),
            base_url: llm.base_url,
            system_prompt: llm.system_prompt,
            request_timeout_secs: llm
                .request_timeout_secs
                .unwrap_or_else(default_request_timeout_secs),
        };

        SwarmConfig {
            limits,
            retry,
            gate,
            aggregator,
            llm,
        }
    }

    /// 環境変数で設定を上書きする
    pub fn apply_env_overrides(&mut self) {
        // 制限値の上書き（パースできない値は無視）
        if let Some(v) = env_parse("SWARM_MAX_PARALLEL_AGENTS") {
            self.limits.max_parallel_agents = v;
        }
        if let Some(v) = env_parse("SWARM_MAX_TOKENS_PER_CONTEXT") {
            self.limits.max_tokens_per_context = v;
        }
        if let Some(v) = env_parse("SWARM_MAX_RECURSION_DEPTH") {
            self.limits.max_recursion_depth = v;
        }
        if let Some(v) = env_parse("SWARM_CONTEXT_TIMEOUT_MS") {
            self.limits.context_timeout_ms = v;
        }
        if let Some(v) = env_parse("SWARM_MAX_RETRIES") {
            self.limits.max_retries = v;
        }
        if let Some(v) = env_parse("SWARM_RATE_LIMIT_PER_SECOND") {
            self.limits.rate_limit_per_second = v;
        }
        if let Some(v) = env_parse("SWARM_SUBTASK_TIMEOUT_MS") {
            self.limits.subtask_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse("SWARM_TOKENS_PER_SUBTASK") {
            self.limits.tokens_per_subtask = Some(v);
        }

        // LLM 設定の上書き
        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            if !model.is_empty() {
                self.llm.model = model;
            }
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            if !provider.is_empty() {
                self.llm.provider = LlmProvider::parse(&provider);
            }
        }
        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            if !base_url.is_empty() {
                self.llm.base_url = Some(base_url);
            }
        }
    }

    /// 設定値の整合性を検証する
    pub fn validate(&self) -> crate::Result<()> {
        let limits = &self.limits;

        if limits.max_parallel_agents == 0 {
            return Err(Error::Config("max_parallel_agents must be at least 1".to_string()));
        }
        if limits.max_tokens_per_context == 0 {
            return Err(Error::Config("max_tokens_per_context must be at least 1".to_string()));
        }
        if limits.max_recursion_depth == 0 {
            return Err(Error::Config(
                "max_recursion_depth must be at least 1 (root tasks have depth 1)".to_string(),
            ));
        }
        if limits.context_timeout_ms == 0 {
            return Err(Error::Config("context_timeout_ms must be at least 1".to_string()));
        }
        if limits.rate_limit_per_second == 0 {
            return Err(Error::Config("rate_limit_per_second must be at least 1".to_string()));
        }
        if limits.subtask_timeout_ms == Some(0) {
            return Err(Error::Config("subtask_timeout_ms must be at least 1".to_string()));
        }

        let per_subtask = limits.tokens_per_subtask();
        if per_subtask == 0 || per_subtask > limits.max_tokens_per_context {
            return Err(Error::Config(format!(
                "tokens_per_subtask ({}) must be between 1 and max_tokens_per_context ({})",
                per_subtask, limits.max_tokens_per_context
            )));
        }

        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".to_string()));
        }

        if self.gate.max_input_chars == 0 || self.gate.max_output_chars == 0 {
            return Err(Error::Config("gate length limits must be at least 1".to_string()));
        }
        if self.gate.repetition_window == 0 {
            return Err(Error::Config("gate.repetition_window must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.gate.max_repetition_ratio) {
            return Err(Error::Config(
                "gate.max_repetition_ratio must be within 0.0..=1.0".to_string(),
            ));
        }

        if let DedupPolicy::Similarity { threshold } = self.aggregator.dedup {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(Error::Config(
                    "aggregator similarity threshold must be within (0.0, 1.0]".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// TOML 構造体定義（ファイル解析用）
// ============================================================================

/// TOML ファイル用のトップレベル構造
#[derive(Debug, Deserialize)]
struct TomlConfig {
    /// 制限値
    limits: Option<TomlLimitsConfig>,
    /// リトライ設定
    retry: Option<TomlRetryConfig>,
    /// セキュリティゲート設定
    gate: Option<TomlGateConfig>,
    /// 集約設定
    aggregator: Option<TomlAggregatorConfig>,
    /// LLM 設定
    llm: Option<TomlLlmConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLimitsConfig {
    #[serde(default, alias = "maxParallelAgents")]
    max_parallel_agents: Option<usize>,
    #[serde(default, alias = "maxTokensPerContext")]
    max_tokens_per_context: Option<u64>,
    #[serde(default, alias = "maxRecursionDepth")]
    max_recursion_depth: Option<u32>,
    #[serde(default, alias = "contextTimeoutMs")]
    context_timeout_ms: Option<u64>,
    #[serde(default, alias = "maxRetries")]
    max_retries: Option<u32>,
    #[serde(default, alias = "rateLimitPerSecond")]
    rate_limit_per_second: Option<u32>,
    #[serde(default, alias = "subtaskTimeoutMs")]
    subtask_timeout_ms: Option<u64>,
    #[serde(default, alias = "tokensPerSubtask")]
    tokens_per_subtask: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlRetryConfig {
    /// 初回リトライまでの待機時間
    #[serde(default)]
    initial_delay_ms: Option<u64>,
    /// バックオフ倍率
    #[serde(default)]
    multiplier: Option<f64>,
    /// 待機時間の上限
    #[serde(default)]
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlGateConfig {
    #[serde(default)]
    builtin_rules: Option<bool>,
    #[serde(default)]
    max_input_chars: Option<usize>,
    #[serde(default)]
    max_output_chars: Option<usize>,
    #[serde(default)]
    max_nesting_depth: Option<usize>,
    #[serde(default)]
    repetition_window: Option<usize>,
    #[serde(default)]
    max_repetition_ratio: Option<f64>,
    #[serde(default)]
    min_repetition_sample: Option<usize>,
    /// 追加ルール
    #[serde(default)]
    extra_rules: Option<Vec<PatternRuleConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlAggregatorConfig {
    /// 重複排除ポリシー
    #[serde(default)]
    dedup: Option<DedupPolicy>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLlmConfig {
    /// API プロバイダー ("claude" または "openai")
    #[serde(default)]
    provider: Option<String>,
    /// モデル名
    #[serde(default)]
    model: Option<String>,
    /// API キー
    #[serde(default)]
    api_key: Option<String>,
    /// ベース URL (オプション)
    #[serde(default)]
    base_url: Option<String>,
    /// システムプロンプト
    #[serde(default)]
    system_prompt: Option<String>,
    /// リクエストタイムアウト（秒）
    #[serde(default)]
    request_timeout_secs: Option<u64>,
}
