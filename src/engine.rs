//! Host-facing façade over the scheduling subsystem.
//!
//! A host (CLI, IPC layer, tests) creates batches, submits task ids for
//! execution and controls running batches through this one type. The
//! engine also feeds the token estimator from every successful
//! completion.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::chunker::{approx_tokens, chunk_content};
use crate::core::client::{ProbeTarget, TranslationClient};
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{Batch, BatchConfig, BatchCounters, ReplyMode, Task, TaskStatus};
use crate::scheduler::batch::{BatchScheduler, SchedulerEvent, SchedulerStatus};
use crate::scheduler::estimator::{RegressionCoefficients, RegressionSample, TokenEstimator};
use crate::scheduler::executor::TranslationExecutor;
use crate::scheduler::state::{TaskEvent, TaskStateManager};
use crate::storage::TaskStore;

/// Entry point for hosts driving batch translation
pub struct TranslationEngine {
    states: Arc<TaskStateManager>,
    executor: Arc<TranslationExecutor>,
    probe_target: Option<Arc<dyn ProbeTarget>>,
    estimator: Mutex<TokenEstimator>,
    batches: Mutex<HashMap<String, Batch>>,
    tasks: Mutex<HashMap<String, Task>>,
    schedulers: Mutex<HashMap<String, Arc<BatchScheduler>>>,
    /// Terminal failures per batch, kept for retry_failed
    failed: Mutex<HashMap<String, HashSet<String>>>,
}

impl TranslationEngine {
    /// Build an engine and start its estimator feeder
    pub fn new(
        client: Arc<dyn TranslationClient>,
        probe_target: Option<Arc<dyn ProbeTarget>>,
        store: Arc<dyn TaskStore>,
    ) -> Arc<Self> {
        let states = Arc::new(TaskStateManager::new(store));
        let executor = Arc::new(TranslationExecutor::new(client, states.clone()));

        let engine = Arc::new(Self {
            states,
            executor,
            probe_target,
            estimator: Mutex::new(TokenEstimator::new()),
            batches: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            schedulers: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
        });

        Self::spawn_feeder(&engine);
        engine
    }

    /// Every completion becomes a regression sample; every failure is
    /// remembered for retry. Holds only a weak reference so the feeder
    /// dies with the engine.
    fn spawn_feeder(engine: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(engine);
        let mut events = engine.states.subscribe();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                match event {
                    TaskEvent::Completed {
                        task_id,
                        batch_id,
                        input_tokens,
                        output_tokens,
                        ..
                    } => {
                        engine
                            .record_completion(&task_id, &batch_id, input_tokens, output_tokens)
                            .await;
                    }
                    TaskEvent::Failed { task_id, batch_id, .. } => {
                        engine
                            .failed
                            .lock()
                            .await
                            .entry(batch_id)
                            .or_default()
                            .insert(task_id);
                    }
                    _ => {}
                }
            }
        });
    }

    async fn record_completion(
        &self,
        task_id: &str,
        batch_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) {
        // A retried task that now succeeded is no longer failed
        if let Some(set) = self.failed.lock().await.get_mut(batch_id) {
            set.remove(task_id);
        }

        let input_length = {
            let tasks = self.tasks.lock().await;
            match tasks.get(task_id) {
                Some(task) => task.content.len() as u64,
                None => return,
            }
        };
        let model_id = {
            let batches = self.batches.lock().await;
            match batches.get(batch_id) {
                Some(batch) => batch.config.model_id.clone(),
                None => return,
            }
        };

        self.estimator.lock().await.add_sample(RegressionSample {
            model_id,
            input_length,
            input_tokens,
            output_tokens,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Split `content` into tasks and register a new batch. Reply sizes
    /// are predicted per the configured mode; the regression mode falls
    /// back to an equivalent-length estimate while the model is unknown.
    pub async fn create_batch(
        &self,
        name: &str,
        content: &str,
        config: BatchConfig,
    ) -> Result<String> {
        let chunks = chunk_content(content, config.chunk_strategy, config.chunk_size);
        if chunks.is_empty() {
            return Err(TranslationError::ConfigError {
                message: "No translatable content after chunking".to_string(),
            });
        }

        let mut batch = Batch::new(name, config.clone());
        let estimator = self.estimator.lock().await;
        let mut tasks = self.tasks.lock().await;

        for chunk in chunks {
            let mut task = Task::new(batch.id.clone(), chunk);
            task.input_tokens = approx_tokens(&task.content);
            task.estimated_tokens = match config.reply_mode {
                ReplyMode::Predicted => config.predicted_tokens,
                ReplyMode::Equivalent => task.input_tokens,
                ReplyMode::Regression => estimator
                    .estimate(task.content.len() as u64, &config.model_id)
                    .unwrap_or(task.input_tokens),
            };
            batch.task_ids.push(task.id.clone());
            tasks.insert(task.id.clone(), task);
        }
        drop(estimator);
        drop(tasks);

        let batch_id = batch.id.clone();
        info!(
            "Created batch {} ({}) with {} tasks",
            batch_id,
            name,
            batch.task_ids.len()
        );
        self.batches.lock().await.insert(batch_id.clone(), batch);
        Ok(batch_id)
    }

    /// Submit task ids of a batch for execution. Appends to a live
    /// scheduler when one exists, otherwise replaces any stale scheduler
    /// with a fresh run (one scheduler per batch id, ever).
    pub async fn submit(&self, batch_id: &str, task_ids: Vec<String>) -> Result<String> {
        let batch = self
            .batches
            .lock()
            .await
            .get(batch_id)
            .cloned()
            .ok_or_else(|| TranslationError::StateError {
                message: format!("Unknown batch: {}", batch_id),
            })?;

        {
            let tasks = self.tasks.lock().await;
            for id in &task_ids {
                let Some(task) = tasks.get(id) else {
                    return Err(TranslationError::StateError {
                        message: format!("Unknown task: {}", id),
                    });
                };
                self.states
                    .initialize_task(id, batch_id, &task.content, task.estimated_tokens)
                    .await;
                self.states.update_state(id, TaskStatus::Waiting).await;
            }
        }

        let mut schedulers = self.schedulers.lock().await;
        if let Some(existing) = schedulers.remove(batch_id) {
            let status = existing.snapshot().status;
            if matches!(
                status,
                SchedulerStatus::Running | SchedulerStatus::Paused | SchedulerStatus::Throttled
            ) {
                schedulers.insert(batch_id.to_string(), existing.clone());
                drop(schedulers);
                existing.add_tasks(task_ids).await;
                return Ok(uuid::Uuid::new_v4().to_string());
            }
            // Stale scheduler from a finished or dead run
            existing.destroy().await;
        }

        let scheduler = Arc::new(BatchScheduler::new(
            batch_id,
            task_ids,
            batch.config.clone(),
            self.executor.clone(),
            self.states.clone(),
            self.probe_target.clone(),
        ));
        schedulers.insert(batch_id.to_string(), scheduler.clone());
        drop(schedulers);

        scheduler.start().await;
        Ok(uuid::Uuid::new_v4().to_string())
    }

    /// Convenience: submit every task of a batch
    pub async fn submit_all(&self, batch_id: &str) -> Result<String> {
        let task_ids = {
            let batches = self.batches.lock().await;
            batches
                .get(batch_id)
                .map(|b| b.task_ids.clone())
                .ok_or_else(|| TranslationError::StateError {
                    message: format!("Unknown batch: {}", batch_id),
                })?
        };
        self.submit(batch_id, task_ids).await
    }

    pub async fn pause_batch(&self, batch_id: &str) {
        self.executor.pause_batch(batch_id).await;
        if let Some(scheduler) = self.schedulers.lock().await.get(batch_id) {
            scheduler.pause().await;
        }
    }

    pub async fn resume_batch(&self, batch_id: &str) {
        self.executor.resume_batch(batch_id).await;
        if let Some(scheduler) = self.schedulers.lock().await.get(batch_id) {
            scheduler.resume().await;
        }
    }

    /// Cancel one task, whether waiting or in flight
    pub async fn cancel_task(&self, batch_id: &str, task_id: &str) {
        if let Some(scheduler) = self.schedulers.lock().await.get(batch_id) {
            scheduler.cancel_task(task_id).await;
            return;
        }
        // No live run: only a waiting task can be reverted
        if let Some(state) = self.states.get_state(task_id).await {
            if state.status == TaskStatus::Waiting {
                self.states.update_state(task_id, TaskStatus::Unsent).await;
            }
        }
    }

    /// Cancel every waiting and in-flight task of a batch
    pub async fn cancel_batch(&self, batch_id: &str) {
        if let Some(scheduler) = self.schedulers.lock().await.get(batch_id) {
            scheduler.cancel_all().await;
        }
    }

    /// Resubmit every task that ended in `error` or `throttled`,
    /// incrementing its retry count.
    pub async fn retry_failed(&self, batch_id: &str) -> Result<usize> {
        let failed: Vec<String> = self
            .failed
            .lock()
            .await
            .remove(batch_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        if failed.is_empty() {
            debug!("retry_failed: nothing to retry for batch {}", batch_id);
            return Ok(0);
        }

        {
            let mut tasks = self.tasks.lock().await;
            for id in &failed {
                if let Some(task) = tasks.get_mut(id) {
                    task.retry_count += 1;
                }
            }
        }

        let count = failed.len();
        self.submit(batch_id, failed).await?;
        Ok(count)
    }

    /// Crash recovery at process start: tasks the store still records as
    /// `sending` are forced to `error/APP_CRASHED`.
    pub async fn recover_interrupted(&self) -> usize {
        self.states.recover_interrupted().await
    }

    /// Aggregate counters for a batch's live run
    pub async fn batch_counters(&self, batch_id: &str) -> BatchCounters {
        self.states.batch_counters(batch_id).await
    }

    pub async fn batch(&self, batch_id: &str) -> Option<Batch> {
        self.batches.lock().await.get(batch_id).cloned()
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Live snapshots of a batch's tasks
    pub async fn task_states(&self, batch_id: &str) -> Vec<crate::scheduler::state::TaskState> {
        self.states.batch_states(batch_id).await
    }

    /// Subscribe to task lifecycle events
    pub fn task_events(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.states.subscribe()
    }

    /// Subscribe to a batch's scheduler signals, if it has a scheduler
    pub async fn scheduler_events(
        &self,
        batch_id: &str,
    ) -> Option<tokio::sync::broadcast::Receiver<SchedulerEvent>> {
        self.schedulers
            .lock()
            .await
            .get(batch_id)
            .map(|s| s.subscribe())
    }

    /// Current regression fit for a model, if trained
    pub async fn regression(&self, model_id: &str) -> Option<RegressionCoefficients> {
        self.estimator.lock().await.coefficients(model_id)
    }

    /// Tear down a batch's scheduler explicitly
    pub async fn destroy_scheduler(&self, batch_id: &str) {
        if let Some(scheduler) = self.schedulers.lock().await.remove(batch_id) {
            scheduler.destroy().await;
        }
    }
}
