//! Runs individual tasks end-to-end through the translation-client port.
//!
//! The executor never lets a provider failure escape: every outcome is
//! classified and reported to the state manager, which is the single
//! point of truth for what happened to a task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::client::TranslationClient;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{BatchConfig, TaskStatus, TranslateOutcome, TranslateRequest};
use crate::scheduler::state::TaskStateManager;

/// Pause between consecutive tasks on one worker, to avoid bursting the
/// provider
const TASK_DEBOUNCE: Duration = Duration::from_millis(100);

/// Drives tasks through the provider call and reports to the state
/// manager
pub struct TranslationExecutor {
    client: Arc<dyn TranslationClient>,
    states: Arc<TaskStateManager>,
    /// Cancellation handles for in-flight calls, keyed by task id
    inflight: Mutex<HashMap<String, CancellationToken>>,
    paused: Mutex<HashSet<String>>,
}

impl TranslationExecutor {
    pub fn new(client: Arc<dyn TranslationClient>, states: Arc<TaskStateManager>) -> Self {
        Self {
            client,
            states,
            inflight: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
        }
    }

    /// Make workers of this batch exit their loop after the current task.
    /// An in-flight call is not pre-empted.
    pub async fn pause_batch(&self, batch_id: &str) {
        self.paused.lock().await.insert(batch_id.to_string());
    }

    pub async fn resume_batch(&self, batch_id: &str) {
        self.paused.lock().await.remove(batch_id);
    }

    /// Abort the in-flight call of one task, if any. The aborted task is
    /// classified `USER_CANCELLED` by its worker.
    pub async fn cancel_task(&self, task_id: &str) {
        if let Some(token) = self.inflight.lock().await.get(task_id) {
            token.cancel();
        }
    }

    /// Whether a task currently holds an in-flight call
    pub async fn is_inflight(&self, task_id: &str) -> bool {
        self.inflight.lock().await.contains_key(task_id)
    }

    /// Run a set of tasks through `min(concurrency, task_count)` workers
    /// over a shared batch-scoped queue. Returns when the queue drains or
    /// the batch is paused.
    pub async fn execute_tasks(
        &self,
        batch_id: &str,
        task_ids: Vec<String>,
        config: &BatchConfig,
        concurrency: usize,
    ) {
        if task_ids.is_empty() {
            return;
        }

        let workers = concurrency.max(1).min(task_ids.len());
        let queue = Mutex::new(VecDeque::from(task_ids));

        futures::future::join_all((0..workers).map(|_| async {
            loop {
                if self.paused.lock().await.contains(batch_id) {
                    debug!("Worker exiting, batch {} paused", batch_id);
                    break;
                }
                let next = queue.lock().await.pop_front();
                let Some(task_id) = next else {
                    break;
                };
                self.execute_one(batch_id, &task_id, config).await;
                sleep(TASK_DEBOUNCE).await;
            }
        }))
        .await;
    }

    /// Run one task to a terminal state
    pub async fn execute_one(&self, batch_id: &str, task_id: &str, config: &BatchConfig) {
        let Some(snapshot) = self.states.get_state(task_id).await else {
            warn!("Task {} has no initialized state, skipping", task_id);
            return;
        };

        self.states.update_state(task_id, TaskStatus::Sending).await;

        let request = TranslateRequest {
            task_id: task_id.to_string(),
            model_id: config.model_id.clone(),
            system_prompt: config.system_prompt.clone(),
            content: snapshot.content,
            estimated_tokens: snapshot.estimated_tokens,
        };

        let cancel = CancellationToken::new();
        self.inflight
            .lock()
            .await
            .insert(task_id.to_string(), cancel.clone());

        let result = if config.stream {
            self.run_streaming(batch_id, task_id, &request, cancel.clone()).await
        } else {
            self.client.translate(&request).await
        };

        self.inflight.lock().await.remove(task_id);

        match result {
            Ok(outcome) => {
                self.states.mark_complete(task_id, outcome).await;
            }
            Err(e) => {
                let kind = e.kind();
                debug!("Task {} failed as {}: {}", task_id, kind, e);
                self.states
                    .mark_error(task_id, kind, &e.to_string(), snapshot.retry_count)
                    .await;
            }
        }
    }

    /// Streaming call: drain partial chunks into the state manager while
    /// the provider call runs. The cancellation flag is checked before
    /// each chunk is applied, so a cancelled task stops accumulating even
    /// mid-stream.
    async fn run_streaming(
        &self,
        _batch_id: &str,
        task_id: &str,
        request: &TranslateRequest,
        cancel: CancellationToken,
    ) -> Result<TranslateOutcome> {
        let (tx, mut rx) = mpsc::channel::<String>(32);

        let client = self.client.clone();
        let call_request = request.clone();
        let call_cancel = cancel.clone();
        let call = tokio::spawn(async move {
            client.translate_stream(&call_request, tx, call_cancel).await
        });

        let mut received_chars = 0usize;
        while let Some(chunk) = rx.recv().await {
            if cancel.is_cancelled() {
                // Stop applying chunks; the client call will surface
                // the cancellation as its result
                continue;
            }
            received_chars += chunk.len();
            let current_tokens = ((received_chars / 4).max(1)) as u64;
            self.states
                .update_progress(task_id, &chunk, current_tokens)
                .await;
        }

        match call.await {
            Ok(result) => result,
            Err(e) => Err(TranslationError::StateError {
                message: format!("streaming call aborted: {}", e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chunker::approx_tokens;
    use crate::core::errors::ErrorKind;
    use crate::storage::MemoryTaskStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted client: emits `chunks` with a small delay between them,
    /// then succeeds, unless `fail_with` is set.
    struct ScriptedClient {
        chunks: Vec<&'static str>,
        fail_with: Option<fn() -> TranslationError>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedClient {
        fn ok(chunks: Vec<&'static str>) -> Self {
            Self {
                chunks,
                fail_with: None,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn failing(fail_with: fn() -> TranslationError) -> Self {
            Self {
                chunks: vec![],
                fail_with: Some(fail_with),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TranslationClient for ScriptedClient {
        async fn translate(&self, request: &TranslateRequest) -> Result<TranslateOutcome> {
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            Ok(TranslateOutcome {
                translation: self.chunks.concat(),
                input_tokens: approx_tokens(&request.content),
                output_tokens: 10,
                duration_ms: 5,
                cost: 0.001,
            })
        }

        async fn translate_stream(
            &self,
            request: &TranslateRequest,
            chunks: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> Result<TranslateOutcome> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);

            let result = async {
                if let Some(fail) = self.fail_with {
                    return Err(fail());
                }
                for chunk in &self.chunks {
                    if cancel.is_cancelled() {
                        return Err(TranslationError::Cancelled);
                    }
                    let _ = chunks.send(chunk.to_string()).await;
                    sleep(Duration::from_millis(20)).await;
                }
                Ok(TranslateOutcome {
                    translation: self.chunks.concat(),
                    input_tokens: approx_tokens(&request.content),
                    output_tokens: 10,
                    duration_ms: 5,
                    cost: 0.001,
                })
            }
            .await;

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    async fn setup(
        client: ScriptedClient,
    ) -> (Arc<TranslationExecutor>, Arc<TaskStateManager>, Arc<ScriptedClient>) {
        let store = Arc::new(MemoryTaskStore::new());
        let states = Arc::new(TaskStateManager::new(store));
        let client = Arc::new(client);
        let executor = Arc::new(TranslationExecutor::new(client.clone(), states.clone()));
        (executor, states, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_completes_task() {
        let (executor, states, _) = setup(ScriptedClient::ok(vec!["Hello ", "world"])).await;
        states.initialize_task("t1", "b1", "source", 10).await;
        states.update_state("t1", TaskStatus::Waiting).await;

        executor.execute_one("b1", "t1", &BatchConfig::default()).await;

        let state = states.get_state("t1").await.unwrap();
        assert_eq!(state.status, TaskStatus::Completed);
        assert_eq!(state.translation, "Hello world");
        assert_eq!(state.progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_classified() {
        let (executor, states, _) = setup(ScriptedClient::failing(|| {
            TranslationError::RateLimitError { retry_after: None }
        }))
        .await;
        states.initialize_task("t1", "b1", "source", 10).await;
        states.update_state("t1", TaskStatus::Waiting).await;

        executor.execute_one("b1", "t1", &BatchConfig::default()).await;

        let state = states.get_state("t1").await.unwrap();
        assert_eq!(state.status, TaskStatus::Throttled);
        assert_eq!(state.error_kind, Some(ErrorKind::RateLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_cancellation() {
        let (executor, states, _) = setup(ScriptedClient::ok(vec![
            "one ", "two ", "three ", "four ", "five",
        ]))
        .await;
        states.initialize_task("t1", "b1", "source", 100).await;
        states.update_state("t1", TaskStatus::Waiting).await;

        let run = {
            let executor = executor.clone();
            let config = BatchConfig::default();
            tokio::spawn(async move { executor.execute_one("b1", "t1", &config).await })
        };

        // Let exactly two chunks through (20ms apart), then cancel
        sleep(Duration::from_millis(30)).await;
        assert!(executor.is_inflight("t1").await);
        executor.cancel_task("t1").await;
        run.await.unwrap();
        assert!(!executor.is_inflight("t1").await);

        let state = states.get_state("t1").await.unwrap();
        assert_eq!(state.status, TaskStatus::Error);
        assert_eq!(state.error_kind, Some(ErrorKind::UserCancelled));
        assert_eq!(state.translation, "one two ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_respects_concurrency() {
        let (executor, states, client) = setup(ScriptedClient::ok(vec!["x"])).await;

        let ids: Vec<String> = (0..5).map(|i| format!("t{}", i)).collect();
        for id in &ids {
            states.initialize_task(id, "b1", "source", 10).await;
            states.update_state(id, TaskStatus::Waiting).await;
        }

        executor
            .execute_tasks("b1", ids.clone(), &BatchConfig::default(), 2)
            .await;

        assert!(client.max_active.load(Ordering::SeqCst) <= 2);
        for id in &ids {
            assert_eq!(
                states.get_state(id).await.unwrap().status,
                TaskStatus::Completed
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_workers_between_tasks() {
        let (executor, states, _) = setup(ScriptedClient::ok(vec!["x"])).await;

        let ids: Vec<String> = (0..4).map(|i| format!("t{}", i)).collect();
        for id in &ids {
            states.initialize_task(id, "b1", "source", 10).await;
            states.update_state(id, TaskStatus::Waiting).await;
        }

        executor.pause_batch("b1").await;
        executor
            .execute_tasks("b1", ids.clone(), &BatchConfig::default(), 1)
            .await;

        // Paused before any pop: nothing ran
        for id in &ids {
            assert_eq!(
                states.get_state(id).await.unwrap().status,
                TaskStatus::Waiting
            );
        }
    }
}
