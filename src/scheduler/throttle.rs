//! Throttle probing: detecting when a rate-limited model is usable again

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::core::client::ProbeTarget;
use crate::core::models::ProbeSettings;

/// Signals emitted by a probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    /// Outcome of one probe attempt
    TestResult { attempt: u32, ok: bool },
    /// The provider answered, throttling has lifted
    Recovered,
    /// Gave up after the configured number of consecutive failures
    MaxRetriesReached,
}

/// Periodically tests whether a previously rate-limited model is usable
/// again. A probe failure is never escalated as a task error, only
/// reported as a signal.
pub struct ThrottleProbe {
    target: Arc<dyn ProbeTarget>,
    model_id: String,
    settings: ProbeSettings,
    events: broadcast::Sender<ProbeEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThrottleProbe {
    pub fn new(target: Arc<dyn ProbeTarget>, model_id: impl Into<String>, settings: ProbeSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            target,
            model_id: model_id.into(),
            settings,
            events,
            handle: Mutex::new(None),
        }
    }

    /// Subscribe to probe signals
    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    /// Probe immediately, then poll at the configured interval until the
    /// provider answers or `max_retries` consecutive failures occur.
    /// Restarting replaces any loop already running.
    pub async fn start_probing(&self) {
        self.stop().await;

        let target = self.target.clone();
        let model_id = self.model_id.clone();
        let settings = self.settings;
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let attempt = failures;
                let ok = target.probe(settings.kind, &model_id).await.is_ok();
                let _ = events.send(ProbeEvent::TestResult { attempt, ok });

                if ok {
                    info!("Throttle probe succeeded for model {}", model_id);
                    let _ = events.send(ProbeEvent::Recovered);
                    return;
                }

                failures += 1;
                debug!(
                    "Throttle probe failed for model {} ({}/{})",
                    model_id, failures, settings.max_retries
                );
                if failures >= settings.max_retries {
                    let _ = events.send(ProbeEvent::MaxRetriesReached);
                    return;
                }

                sleep(Duration::from_secs(settings.interval_secs)).await;
            }
        });

        *self.handle.lock().await = Some(handle);
    }

    /// One on-demand probe, independent of the polling loop
    pub async fn test(&self) -> bool {
        let ok = self.target.probe(self.settings.kind, &self.model_id).await.is_ok();
        let _ = self.events.send(ProbeEvent::TestResult { attempt: 0, ok });
        ok
    }

    /// Stop the polling loop. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{Result, TranslationError};
    use crate::core::models::ProbeKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `fail_first` probes, then succeeds
    struct FlakyTarget {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProbeTarget for FlakyTarget {
        async fn probe(&self, _kind: ProbeKind, _model_id: &str) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(TranslationError::RateLimitError { retry_after: None })
            } else {
                Ok(())
            }
        }
    }

    fn probe_with(fail_first: u32, max_retries: u32) -> ThrottleProbe {
        ThrottleProbe::new(
            Arc::new(FlakyTarget {
                fail_first,
                calls: AtomicU32::new(0),
            }),
            "test-model",
            ProbeSettings {
                kind: ProbeKind::Quick,
                interval_secs: 5,
                max_retries,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failures() {
        let probe = probe_with(2, 5);
        let mut events = probe.subscribe();
        probe.start_probing().await;

        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            seen.push(event);
            if matches!(event, ProbeEvent::Recovered | ProbeEvent::MaxRetriesReached) {
                break;
            }
        }

        assert_eq!(
            seen,
            vec![
                ProbeEvent::TestResult { attempt: 0, ok: false },
                ProbeEvent::TestResult { attempt: 1, ok: false },
                ProbeEvent::TestResult { attempt: 2, ok: true },
                ProbeEvent::Recovered,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let probe = probe_with(100, 3);
        let mut events = probe.subscribe();
        probe.start_probing().await;

        let mut failures = 0;
        loop {
            match events.recv().await.unwrap() {
                ProbeEvent::TestResult { ok: false, .. } => failures += 1,
                ProbeEvent::TestResult { ok: true, .. } => panic!("unexpected success"),
                ProbeEvent::Recovered => panic!("unexpected recovery"),
                ProbeEvent::MaxRetriesReached => break,
            }
        }
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn test_on_demand_probe() {
        let probe = probe_with(0, 3);
        let mut events = probe.subscribe();

        assert!(probe.test().await);
        assert_eq!(
            events.recv().await.unwrap(),
            ProbeEvent::TestResult { attempt: 0, ok: true }
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let probe = probe_with(100, 3);
        probe.start_probing().await;
        probe.stop().await;
        probe.stop().await;
    }
}
