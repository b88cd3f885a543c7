use serde::{Deserialize, Serialize};

/// Main configuration structure for the conductor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Pipeline-wide policies
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry policy for transient stage failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Intent stage configuration
    #[serde(default)]
    pub intent: IntentConfig,

    /// Context retrieval configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Plan generation configuration
    #[serde(default)]
    pub planning: PlanningConfig,

    /// Execution stage configuration
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Validation stage configuration
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Validate-and-fix loop configuration
    #[serde(default)]
    pub fix_loop: FixLoopConfig,

    /// Streaming event queue configuration
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to do when no chunk meets the relevance floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStarvedPolicy {
    /// Fail the request
    #[default]
    Halt,
    /// Continue with an empty context and mark the plan as context-starved
    Proceed,
}

/// Pipeline-wide policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    #[serde(default)]
    pub context_starved_policy: ContextStarvedPolicy,

    /// Write artifacts through the repository accessor on completion
    #[serde(default)]
    pub write_artifacts: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context_starved_policy: ContextStarvedPolicy::default(),
            write_artifacts: false,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum attempts per stage invocation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between successive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound of the random jitter fraction added to each delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_jitter_ratio() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Intent stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IntentConfig {
    /// Below this confidence the request is sent back for clarification
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Provider retries inside the stage before surfacing a transient error
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,
}

const fn default_confidence_threshold() -> f32 {
    0.6
}

const fn default_provider_retries() -> u32 {
    2
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            provider_retries: default_provider_retries(),
        }
    }
}

/// Context retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ContextConfig {
    /// Token budget for retrieved chunks
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Characters per token used to estimate chunk size
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// Minimum relevance for a chunk to be considered
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f32,

    /// Number of candidates requested from the index
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

const fn default_token_budget() -> usize {
    8_000
}

const fn default_chars_per_token() -> usize {
    4
}

const fn default_relevance_floor() -> f32 {
    0.2
}

const fn default_max_candidates() -> usize {
    50
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            chars_per_token: default_chars_per_token(),
            relevance_floor: default_relevance_floor(),
            max_candidates: default_max_candidates(),
        }
    }
}

/// Plan generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlanningConfig {
    /// Re-generations allowed after a recoverable plan or execution error
    #[serde(default = "default_max_regenerations")]
    pub max_regenerations: u32,

    /// Upper bound on plan length
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

const fn default_max_regenerations() -> u32 {
    1
}

const fn default_max_steps() -> usize {
    20
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_regenerations: default_max_regenerations(),
            max_steps: default_max_steps(),
        }
    }
}

/// Execution stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionConfig {
    /// Top chunks sampled for pattern extraction
    #[serde(default = "default_pattern_sample_chunks")]
    pub pattern_sample_chunks: usize,

    /// Minimum line-diff ratio for an alignment splice
    #[serde(default = "default_alignment_threshold")]
    pub alignment_threshold: f32,

    /// Forward provider deltas as content events while generating
    #[serde(default)]
    pub streaming: bool,
}

const fn default_pattern_sample_chunks() -> usize {
    5
}

const fn default_alignment_threshold() -> f32 {
    0.6
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            pattern_sample_chunks: default_pattern_sample_chunks(),
            alignment_threshold: default_alignment_threshold(),
            streaming: false,
        }
    }
}

/// Validation stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ValidationConfig {
    /// Ask the provider for a review in the deep tier
    #[serde(default = "default_true")]
    pub deep_review: bool,
}

const fn default_true() -> bool {
    true
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { deep_review: true }
    }
}

/// Validate-and-fix loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FixLoopConfig {
    /// Validation iterations, counting the initial one
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

const fn default_max_iterations() -> u32 {
    3
}

impl Default for FixLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

/// Streaming event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StreamingConfig {
    /// Bounded queue capacity; events beyond it are dropped and counted
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_queue_capacity() -> usize {
    256
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Rotation for file logs: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
