//! Scripted mock translation client shared by the scenario tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use translation_scheduler::core::client::{ProbeTarget, TranslationClient};
use translation_scheduler::core::errors::{Result, TranslationError};
use translation_scheduler::core::models::{ProbeKind, TranslateOutcome, TranslateRequest};

/// What the mock does when asked to translate a given task
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit these chunks with a delay between them, then succeed
    Succeed(Vec<&'static str>),
    /// Fail with a provider rate limit
    RateLimit,
    /// Fail with a network error
    NetworkError,
}

/// Deterministic stand-in for the provider client
pub struct MockClient {
    scripts: Mutex<HashMap<String, Script>>,
    chunk_delay: Duration,
    /// Calls currently in flight
    active: AtomicUsize,
    /// High-water mark of concurrent calls
    pub max_active: AtomicUsize,
    called: Mutex<Vec<String>>,
    /// Probes that fail before the first success
    probe_fail_first: AtomicU32,
    probe_calls: AtomicU32,
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            chunk_delay: Duration::from_millis(20),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            called: Mutex::new(Vec::new()),
            probe_fail_first: AtomicU32::new(0),
            probe_calls: AtomicU32::new(0),
        }
    }

    pub fn script(&self, task_id: &str, script: Script) {
        self.scripts.lock().unwrap().insert(task_id.to_string(), script);
    }

    pub fn fail_probes(&self, count: u32) {
        self.probe_fail_first.store(count, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn called_tasks(&self) -> Vec<String> {
        self.called.lock().unwrap().clone()
    }

    fn script_for(&self, task_id: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or(Script::Succeed(vec!["ok "]))
    }

    async fn run_script(
        &self,
        request: &TranslateRequest,
        chunks: Option<&mpsc::Sender<String>>,
        cancel: &CancellationToken,
    ) -> Result<TranslateOutcome> {
        self.called.lock().unwrap().push(request.task_id.clone());

        match self.script_for(&request.task_id) {
            Script::RateLimit => Err(TranslationError::RateLimitError { retry_after: None }),
            Script::NetworkError => Err(TranslationError::NetworkError {
                message: "connection reset".to_string(),
            }),
            Script::Succeed(parts) => {
                for part in &parts {
                    if cancel.is_cancelled() {
                        return Err(TranslationError::Cancelled);
                    }
                    if let Some(tx) = chunks {
                        let _ = tx.send(part.to_string()).await;
                    }
                    sleep(self.chunk_delay).await;
                }
                let translation: String = parts.concat();
                Ok(TranslateOutcome {
                    input_tokens: (request.content.len() / 4).max(1) as u64,
                    output_tokens: (translation.len() / 4).max(1) as u64,
                    duration_ms: 5,
                    cost: 0.001,
                    translation,
                })
            }
        }
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslationClient for MockClient {
    async fn translate(&self, request: &TranslateRequest) -> Result<TranslateOutcome> {
        let cancel = CancellationToken::new();
        self.run_script(request, None, &cancel).await
    }

    async fn translate_stream(
        &self,
        request: &TranslateRequest,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<TranslateOutcome> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let result = self.run_script(request, Some(&chunks), &cancel).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ProbeTarget for MockClient {
    async fn probe(&self, _kind: ProbeKind, _model_id: &str) -> Result<()> {
        let call = self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.probe_fail_first.load(Ordering::SeqCst) {
            Err(TranslationError::RateLimitError { retry_after: None })
        } else {
            Ok(())
        }
    }
}
