//! Canonical in-memory task state, lifecycle events and snapshot
//! persistence.
//!
//! The cache here is the source of truth for a live run. Persistence is
//! fire-and-forget: failures are logged and never block or corrupt the
//! in-memory state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::errors::ErrorKind;
use crate::core::models::{BatchCounters, TaskStatus, TranslateOutcome};
use crate::storage::{StoreError, TaskStore};

/// Progress emissions and persists are rate-limited to one per task per
/// this interval.
const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Live snapshot of one task
#[derive(Debug, Clone)]
pub struct TaskState {
    pub id: String,
    pub batch_id: String,
    pub status: TaskStatus,
    /// Source text, immutable once created
    pub content: String,
    /// Translation accumulated chunk by chunk while sending
    pub translation: String,
    pub current_tokens: u64,
    pub estimated_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: Option<u64>,
    pub progress: u8,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub cost: f64,
    pub duration_ms: u64,
    last_flush: Option<Instant>,
}

impl TaskState {
    fn new(id: String, batch_id: String, content: String, estimated_tokens: u64) -> Self {
        Self {
            id,
            batch_id,
            status: TaskStatus::Unsent,
            content,
            translation: String::new(),
            current_tokens: 0,
            estimated_tokens,
            input_tokens: 0,
            output_tokens: None,
            progress: 0,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            cost: 0.0,
            duration_ms: 0,
            last_flush: None,
        }
    }
}

/// Lifecycle signals, one broadcast channel per manager
#[derive(Debug, Clone)]
pub enum TaskEvent {
    StateChanged {
        task_id: String,
        batch_id: String,
        status: TaskStatus,
    },
    Progress {
        task_id: String,
        batch_id: String,
        progress: u8,
        current_tokens: u64,
    },
    Completed {
        task_id: String,
        batch_id: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        duration_ms: u64,
    },
    Failed {
        task_id: String,
        batch_id: String,
        kind: ErrorKind,
        message: String,
        retry_count: u32,
    },
}

/// Owns the authoritative state of every task in the process
pub struct TaskStateManager {
    states: RwLock<HashMap<String, TaskState>>,
    store: Arc<dyn TaskStore>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskStateManager {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: RwLock::new(HashMap::new()),
            store,
            events,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine, events are advisory
        let _ = self.events.send(event);
    }

    fn persist<F>(&self, what: &'static str, task_id: &str, fut: F)
    where
        F: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!("Failed to persist {} for task {}: {}", what, task_id, e);
            }
        });
    }

    /// Create a fresh snapshot at `unsent` / 0 progress
    pub async fn initialize_task(
        &self,
        id: &str,
        batch_id: &str,
        content: &str,
        estimated_tokens: u64,
    ) {
        let mut states = self.states.write().await;
        states.entry(id.to_string()).or_insert_with(|| {
            TaskState::new(
                id.to_string(),
                batch_id.to_string(),
                content.to_string(),
                estimated_tokens,
            )
        });
    }

    /// Apply a bare status transition
    pub async fn update_state(&self, id: &str, status: TaskStatus) {
        let batch_id = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(id) else {
                debug!("update_state for unknown task {}", id);
                return;
            };
            state.status = status;
            if matches!(status, TaskStatus::Unsent | TaskStatus::Waiting) {
                // Cancel-revert or resubmission: back to a clean slate,
                // content only accumulates while sending
                state.translation.clear();
                state.current_tokens = 0;
                state.progress = 0;
                state.error_kind = None;
                state.error_message = None;
            }
            state.batch_id.clone()
        };

        self.emit(TaskEvent::StateChanged {
            task_id: id.to_string(),
            batch_id,
            status,
        });

        let store = self.store.clone();
        let task_id = id.to_string();
        self.persist("status", id, async move {
            store.update_status(&task_id, status).await
        });
    }

    /// Append a chunk to the accumulated translation and recompute
    /// progress. Emission and persistence are throttled to one per 100ms
    /// per task; the in-memory state always updates.
    pub async fn update_progress(&self, id: &str, chunk: &str, current_tokens: u64) {
        let flush = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(id) else {
                debug!("update_progress for unknown task {}", id);
                return;
            };

            state.translation.push_str(chunk);
            state.current_tokens = current_tokens;
            let estimated = state.estimated_tokens.max(1);
            state.progress = ((current_tokens * 100) / estimated).min(100) as u8;

            let due = state
                .last_flush
                .map_or(true, |at| at.elapsed() >= PROGRESS_FLUSH_INTERVAL);
            if due {
                state.last_flush = Some(Instant::now());
                Some((
                    state.batch_id.clone(),
                    state.progress,
                    state.current_tokens,
                    state.translation.clone(),
                ))
            } else {
                None
            }
        };

        if let Some((batch_id, progress, tokens, translation)) = flush {
            self.emit(TaskEvent::Progress {
                task_id: id.to_string(),
                batch_id,
                progress,
                current_tokens: tokens,
            });

            let store = self.store.clone();
            let task_id = id.to_string();
            self.persist("progress", id, async move {
                store
                    .update_progress(&task_id, progress, tokens, &translation)
                    .await
            });
        }
    }

    /// Finalize a task as completed
    pub async fn mark_complete(&self, id: &str, outcome: TranslateOutcome) {
        let batch_id = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(id) else {
                debug!("mark_complete for unknown task {}", id);
                return;
            };
            state.status = TaskStatus::Completed;
            state.progress = 100;
            state.translation = outcome.translation.clone();
            state.input_tokens = outcome.input_tokens;
            state.output_tokens = Some(outcome.output_tokens);
            state.current_tokens = outcome.output_tokens;
            state.cost = outcome.cost;
            state.duration_ms = outcome.duration_ms;
            state.batch_id.clone()
        };

        self.emit(TaskEvent::Completed {
            task_id: id.to_string(),
            batch_id,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            cost: outcome.cost,
            duration_ms: outcome.duration_ms,
        });

        let store = self.store.clone();
        let task_id = id.to_string();
        self.persist("completion", id, async move {
            store.update_completion(&task_id, &outcome).await
        });
    }

    /// Record a classified failure. `RATE_LIMIT` lands on `throttled`,
    /// everything else on `error`.
    pub async fn mark_error(&self, id: &str, kind: ErrorKind, message: &str, retry_count: u32) {
        let status = if kind == ErrorKind::RateLimit {
            TaskStatus::Throttled
        } else {
            TaskStatus::Error
        };

        let batch_id = {
            let mut states = self.states.write().await;
            let Some(state) = states.get_mut(id) else {
                debug!("mark_error for unknown task {}", id);
                return;
            };
            state.status = status;
            state.error_kind = Some(kind);
            state.error_message = Some(message.to_string());
            state.retry_count = retry_count;
            state.batch_id.clone()
        };

        self.emit(TaskEvent::Failed {
            task_id: id.to_string(),
            batch_id,
            kind,
            message: message.to_string(),
            retry_count,
        });

        let store = self.store.clone();
        let task_id = id.to_string();
        let message = message.to_string();
        self.persist("error", id, async move {
            store
                .update_error(&task_id, kind, &message, retry_count)
                .await
        });
    }

    /// Sugar for a user-initiated pause
    pub async fn pause_task(&self, id: &str) {
        let retry_count = self
            .get_state(id)
            .await
            .map(|s| s.retry_count)
            .unwrap_or(0);
        self.mark_error(id, ErrorKind::UserPaused, "Paused by user", retry_count)
            .await;
    }

    /// Pure read of one task's live snapshot
    pub async fn get_state(&self, id: &str) -> Option<TaskState> {
        self.states.read().await.get(id).cloned()
    }

    /// Pure read of every snapshot belonging to a batch
    pub async fn batch_states(&self, batch_id: &str) -> Vec<TaskState> {
        self.states
            .read()
            .await
            .values()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect()
    }

    /// Aggregate counters for a batch, always consistent with the cache
    pub async fn batch_counters(&self, batch_id: &str) -> BatchCounters {
        let states = self.states.read().await;
        BatchCounters::tally(
            states
                .values()
                .filter(|s| s.batch_id == batch_id)
                .map(|s| &s.status),
        )
    }

    /// Evict one cache entry
    pub async fn cleanup(&self, id: &str) {
        self.states.write().await.remove(id);
    }

    /// Evict every entry of a drained batch. This is the only
    /// garbage-collection point.
    pub async fn cleanup_batch(&self, batch_id: &str) {
        let mut states = self.states.write().await;
        states.retain(|_, s| s.batch_id != batch_id);
    }

    /// Crash recovery: force tasks the store still records as `sending`
    /// into `error/APP_CRASHED`. `waiting` rows are left untouched so a
    /// user can resume or cancel them explicitly.
    pub async fn recover_interrupted(&self) -> usize {
        let interrupted = match self.store.interrupted_tasks().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Crash-recovery scan failed: {}", e);
                return 0;
            }
        };

        for id in &interrupted {
            if self.get_state(id).await.is_some() {
                // Cached entry: route through the normal path so the
                // failure is also signalled
                self.mark_error(id, ErrorKind::AppCrashed, "Interrupted by shutdown", 0)
                    .await;
            } else if let Err(e) = self
                .store
                .update_error(id, ErrorKind::AppCrashed, "Interrupted by shutdown", 0)
                .await
            {
                warn!("Failed to mark task {} as crashed: {}", id, e);
            }
        }

        if !interrupted.is_empty() {
            info!("Recovered {} interrupted tasks", interrupted.len());
        }
        interrupted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryTaskStore;
    use tokio::time::sleep;

    fn manager() -> (Arc<TaskStateManager>, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        (Arc::new(TaskStateManager::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_initialize_creates_unsent_snapshot() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 100).await;

        let state = manager.get_state("t1").await.unwrap();
        assert_eq!(state.status, TaskStatus::Unsent);
        assert_eq!(state.progress, 0);
        assert_eq!(state.estimated_tokens, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_state_emits_and_persists() {
        let (manager, store) = manager();
        let mut events = manager.subscribe();

        manager.initialize_task("t1", "b1", "src text", 100).await;
        manager.update_state("t1", TaskStatus::Waiting).await;

        match events.recv().await.unwrap() {
            TaskEvent::StateChanged { task_id, status, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(status, TaskStatus::Waiting);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Let the fire-and-forget persist land
        sleep(Duration::from_millis(10)).await;
        assert_eq!(store.row("t1").await.unwrap().status, Some(TaskStatus::Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_emission_is_throttled() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 100).await;
        manager.update_state("t1", TaskStatus::Sending).await;

        let mut events = manager.subscribe();

        // Two chunks in quick succession: only the first flushes
        manager.update_progress("t1", "Hello ", 10).await;
        manager.update_progress("t1", "world", 20).await;

        let mut progress_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TaskEvent::Progress { .. }) {
                progress_events += 1;
            }
        }
        assert_eq!(progress_events, 1);

        // After the flush interval the next chunk emits again
        sleep(Duration::from_millis(150)).await;
        manager.update_progress("t1", "!", 30).await;
        let event = events.try_recv().unwrap();
        assert!(matches!(event, TaskEvent::Progress { current_tokens: 30, .. }));

        // The in-memory accumulation never skips chunks
        let state = manager.get_state("t1").await.unwrap();
        assert_eq!(state.translation, "Hello world!");
        assert_eq!(state.progress, 30);
    }

    #[tokio::test]
    async fn test_progress_caps_at_100() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 10).await;
        manager.update_progress("t1", "way more than expected", 50).await;

        assert_eq!(manager.get_state("t1").await.unwrap().progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_complete() {
        let (manager, store) = manager();
        let mut events = manager.subscribe();
        manager.initialize_task("t1", "b1", "src text", 100).await;

        manager
            .mark_complete(
                "t1",
                TranslateOutcome {
                    translation: "done".to_string(),
                    input_tokens: 40,
                    output_tokens: 90,
                    duration_ms: 1200,
                    cost: 0.01,
                },
            )
            .await;

        let state = manager.get_state("t1").await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.progress, 100);
        assert_eq!(state.output_tokens, Some(90));

        match events.recv().await.unwrap() {
            TaskEvent::Completed { output_tokens, .. } => assert_eq!(output_tokens, 90),
            other => panic!("unexpected event: {:?}", other),
        }

        sleep(Duration::from_millis(10)).await;
        assert_eq!(store.row("t1").await.unwrap().status, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_rate_limit_error_lands_on_throttled() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 100).await;
        manager.initialize_task("t2", "b1", "src text", 100).await;

        manager.mark_error("t1", ErrorKind::RateLimit, "429", 0).await;
        manager.mark_error("t2", ErrorKind::Network, "down", 1).await;

        assert_eq!(manager.get_state("t1").await.unwrap().status, TaskStatus::Throttled);
        assert_eq!(manager.get_state("t2").await.unwrap().status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_pause_task_is_user_paused_error() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 100).await;
        manager.pause_task("t1").await;

        let state = manager.get_state("t1").await.unwrap();
        assert_eq!(state.status, TaskStatus::Error);
        assert_eq!(state.error_kind, Some(ErrorKind::UserPaused));
    }

    #[tokio::test]
    async fn test_cleanup_batch_evicts_only_that_batch() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 100).await;
        manager.initialize_task("t2", "b2", "src text", 100).await;

        manager.cleanup_batch("b1").await;

        assert!(manager.get_state("t1").await.is_none());
        assert!(manager.get_state("t2").await.is_some());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let (manager, store) = manager();
        store.update_status("t1", TaskStatus::Sending).await.unwrap();
        store.update_status("t2", TaskStatus::Waiting).await.unwrap();

        let recovered = manager.recover_interrupted().await;
        assert_eq!(recovered, 1);

        let row = store.row("t1").await.unwrap();
        assert_eq!(row.status, Some(TaskStatus::Error));
        assert_eq!(row.error_kind, Some(ErrorKind::AppCrashed));
        // Waiting rows stay untouched
        assert_eq!(store.row("t2").await.unwrap().status, Some(TaskStatus::Waiting));
    }

    #[tokio::test]
    async fn test_batch_counters_reflect_states() {
        let (manager, _) = manager();
        manager.initialize_task("t1", "b1", "src text", 100).await;
        manager.initialize_task("t2", "b1", "src text", 100).await;
        manager.update_state("t1", TaskStatus::Waiting).await;

        let counters = manager.batch_counters("b1").await;
        assert_eq!(counters.waiting, 1);
        assert_eq!(counters.unsent, 1);
        assert_eq!(counters.total(), 2);
    }
}
