//! Core data models for batch translation scheduling

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::errors::ErrorKind;

/// Lifecycle status of a single translation task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created but not yet submitted to a scheduler
    Unsent,
    /// Queued for dispatch
    Waiting,
    /// A worker slot holds an in-flight provider call
    Sending,
    /// Terminated by a provider rate-limit
    Throttled,
    /// Terminated by any other error
    Error,
    /// Finished successfully
    Completed,
}

impl TaskStatus {
    /// Whether this status ends the current scheduling attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Throttled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unsent => "unsent",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Sending => "sending",
            TaskStatus::Throttled => "throttled",
            TaskStatus::Error => "error",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// How a batch's source text is split into tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Fixed number of non-empty lines per task
    Line,
    /// Pack lines until an approximate token budget is reached
    Token,
}

/// How a task's expected reply size is predicted before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// User-fixed token count
    Predicted,
    /// Assume the reply is about as long as the input
    Equivalent,
    /// Predict from the per-model regression, falling back to equivalent
    Regression,
}

/// Dispatch policy for a scheduler run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    /// Refill a slot on every task completion or error
    Event,
    /// Refill on a fixed interval regardless of individual completions
    Timed,
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingStrategy::Event => write!(f, "event"),
            SchedulingStrategy::Timed => write!(f, "timed"),
        }
    }
}

/// Kind of request used to test whether throttling has lifted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Lightweight connectivity check
    Quick,
    /// Minimal real call to the provider
    Api,
}

/// Throttle probe settings carried on a batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub kind: ProbeKind,
    pub interval_secs: u64,
    pub max_retries: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            kind: ProbeKind::Quick,
            interval_secs: 10,
            max_retries: 5,
        }
    }
}

/// Configuration shared by every task in a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub model_id: String,
    pub system_prompt: String,
    pub chunk_strategy: ChunkStrategy,
    /// Lines per chunk (`Line`) or approximate tokens per chunk (`Token`)
    pub chunk_size: usize,
    pub concurrency: usize,
    pub reply_mode: ReplyMode,
    /// Fixed reply-size guess used by `ReplyMode::Predicted`
    pub predicted_tokens: u64,
    pub scheduling_strategy: SchedulingStrategy,
    /// Timed-strategy dispatch interval, clamped to 1-10s on use
    pub timed_interval_secs: u64,
    /// Stream provider responses chunk by chunk
    pub stream: bool,
    pub throttle_probe: Option<ProbeSettings>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            system_prompt: "You are a professional translator. Translate the user content \
                            and preserve its formatting."
                .to_string(),
            chunk_strategy: ChunkStrategy::Line,
            chunk_size: 20,
            concurrency: 4,
            reply_mode: ReplyMode::Regression,
            predicted_tokens: 512,
            scheduling_strategy: SchedulingStrategy::Event,
            timed_interval_secs: 2,
            stream: true,
            throttle_probe: Some(ProbeSettings::default()),
        }
    }
}

/// One unit of translatable content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub batch_id: String,
    pub status: TaskStatus,
    /// Source text, immutable once created
    pub content: String,
    /// Accumulated while sending, finalized at completion
    pub translation: Option<String>,
    /// Estimated at creation, refined at completion
    pub input_tokens: u64,
    /// Predicted reply size from the estimator or a fixed value
    pub estimated_tokens: u64,
    /// Known only after completion
    pub actual_tokens: Option<u64>,
    /// 0-100, derived from current / estimated tokens
    pub progress: u8,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub cost: f64,
    pub duration_ms: u64,
}

impl Task {
    /// Create a fresh unsent task
    pub fn new(batch_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.into(),
            status: TaskStatus::Unsent,
            content: content.into(),
            translation: None,
            input_tokens: 0,
            estimated_tokens: 0,
            actual_tokens: None,
            progress: 0,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            cost: 0.0,
            duration_ms: 0,
        }
    }
}

/// A named collection of tasks sharing one configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub name: String,
    pub config: BatchConfig,
    pub task_ids: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Batch {
    pub fn new(name: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            config,
            task_ids: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Aggregate counters derived from a batch's member tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub unsent: usize,
    pub waiting: usize,
    pub sending: usize,
    pub throttled: usize,
    pub failed: usize,
    pub completed: usize,
}

impl BatchCounters {
    /// Tally statuses into counters
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a TaskStatus>) -> Self {
        let mut counters = Self::default();
        for status in statuses {
            match status {
                TaskStatus::Unsent => counters.unsent += 1,
                TaskStatus::Waiting => counters.waiting += 1,
                TaskStatus::Sending => counters.sending += 1,
                TaskStatus::Throttled => counters.throttled += 1,
                TaskStatus::Error => counters.failed += 1,
                TaskStatus::Completed => counters.completed += 1,
            }
        }
        counters
    }

    pub fn total(&self) -> usize {
        self.unsent + self.waiting + self.sending + self.throttled + self.failed + self.completed
    }
}

/// Request handed to the translation-client port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateRequest {
    pub task_id: String,
    pub model_id: String,
    pub system_prompt: String,
    pub content: String,
    pub estimated_tokens: u64,
}

/// Final result of one provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateOutcome {
    pub translation: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub cost: f64,
}
