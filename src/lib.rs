//! Batch translation scheduling engine.
//!
//! Splits a body of text into independent translation tasks, drives each
//! through a provider call under a concurrency ceiling, tracks per-task
//! state, recovers from provider rate-limiting and predicts reply sizes
//! from historical behavior.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod engine;
pub mod scheduler;
pub mod storage;

// Re-export key types for convenience
pub use crate::core::{
    client::{HttpTranslationClient, ProbeTarget, TranslationClient},
    config::ProviderConfig,
    errors::{ErrorKind, Result, TranslationError},
    models::{
        Batch, BatchConfig, BatchCounters, ChunkStrategy, ProbeKind, ReplyMode,
        SchedulingStrategy, Task, TaskStatus, TranslateOutcome, TranslateRequest,
    },
};

pub use crate::engine::TranslationEngine;
pub use crate::scheduler::{
    batch::{BatchScheduler, SchedulerEvent, SchedulerStatus},
    estimator::{RegressionCoefficients, RegressionSample, TokenEstimator},
    state::{TaskEvent, TaskStateManager},
};
pub use crate::storage::{MemoryTaskStore, TaskStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
