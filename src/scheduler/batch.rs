//! Batch orchestration: FIFO waiting queue, bounded active set, dispatch
//! policy, throttle windows and completion detection.
//!
//! One scheduler owns one batch run. All queue/active mutation happens
//! under a single lock that is never held across an await, so dispatch
//! decisions and the "last task drained" check are atomic with the
//! completion handler that triggers them.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::core::client::ProbeTarget;
use crate::core::errors::ErrorKind;
use crate::core::models::{BatchConfig, SchedulingStrategy, TaskStatus};
use crate::scheduler::executor::TranslationExecutor;
use crate::scheduler::state::{TaskEvent, TaskStateManager};
use crate::scheduler::throttle::{ProbeEvent, ThrottleProbe};

/// Fallback throttle window when no probe reports recovery
const THROTTLE_RESUME_DELAY: Duration = Duration::from_secs(60);

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Running,
    Paused,
    Throttled,
    Completed,
}

/// Signals a scheduler emits to its host
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    StatusChanged { status: SchedulerStatus },
    Throttled { resume_in: Duration },
    Recovered,
    Paused,
    Resumed,
    Completed { completed: usize, errored: usize },
}

/// Point-in-time view of a run, for hosts and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub status: SchedulerStatus,
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub errored: usize,
}

/// Run state. Owned exclusively by one scheduler, not persisted.
struct SchedulerCore {
    status: SchedulerStatus,
    queue: VecDeque<String>,
    active: HashSet<String>,
    completed: HashSet<String>,
    errored: HashSet<String>,
}

enum Decision {
    Noop,
    Finished { completed: usize, errored: usize },
    Dispatch(Vec<String>),
}

enum FailAction {
    Throttle,
    Refill,
    None,
}

/// Orchestrates one batch run under a concurrency ceiling
pub struct BatchScheduler {
    batch_id: String,
    config: BatchConfig,
    executor: Arc<TranslationExecutor>,
    states: Arc<TaskStateManager>,
    probe_target: Option<Arc<dyn ProbeTarget>>,
    events: broadcast::Sender<SchedulerEvent>,
    core: Mutex<SchedulerCore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn new(
        batch_id: impl Into<String>,
        task_ids: Vec<String>,
        config: BatchConfig,
        executor: Arc<TranslationExecutor>,
        states: Arc<TaskStateManager>,
        probe_target: Option<Arc<dyn ProbeTarget>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            batch_id: batch_id.into(),
            config,
            executor,
            states,
            probe_target,
            events,
            core: Mutex::new(SchedulerCore {
                status: SchedulerStatus::Idle,
                queue: VecDeque::from(task_ids),
                active: HashSet::new(),
                completed: HashSet::new(),
                errored: HashSet::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to scheduler signals
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let core = self.core.lock().unwrap();
        SchedulerSnapshot {
            status: core.status,
            waiting: core.queue.len(),
            active: core.active.len(),
            completed: core.completed.len(),
            errored: core.errored.len(),
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: SchedulerStatus) {
        self.emit(SchedulerEvent::StatusChanged { status });
    }

    /// Wire listeners and begin dispatching.
    ///
    /// `event` strategy refills a slot on every completion/error signal;
    /// `timed` refills on a fixed interval (clamped to 1-10s) for a
    /// predictable request cadence.
    pub async fn start(self: Arc<Self>) {
        {
            let mut core = self.core.lock().unwrap();
            if core.status != SchedulerStatus::Idle {
                warn!("Scheduler for batch {} started twice", self.batch_id);
                return;
            }
            core.status = SchedulerStatus::Running;
        }
        self.set_status(SchedulerStatus::Running);
        info!(
            "Scheduler starting for batch {} ({} strategy, concurrency {})",
            self.batch_id, self.config.scheduling_strategy, self.config.concurrency
        );

        // Listener: reacts to the state manager's terminal task signals
        let listener = {
            let scheduler = self.clone();
            let mut events = self.states.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => scheduler.clone().handle_task_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                "Scheduler for batch {} lagged {} events",
                                scheduler.batch_id, missed
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                    if scheduler.is_finished() {
                        break;
                    }
                }
            })
        };
        self.handles.lock().unwrap().push(listener);

        if self.config.scheduling_strategy == SchedulingStrategy::Timed {
            let secs = self.config.timed_interval_secs.clamp(1, 10);
            let scheduler = self.clone();
            let timer = tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(secs));
                loop {
                    ticker.tick().await;
                    if scheduler.is_finished() {
                        break;
                    }
                    scheduler.process_queue().await;
                }
            });
            self.handles.lock().unwrap().push(timer);
        }

        self.process_queue().await;
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.core.lock().unwrap().status,
            SchedulerStatus::Completed | SchedulerStatus::Idle
        )
    }

    /// Fill free slots from the waiting queue, or declare the run
    /// complete once queue and active set are both empty. No-op unless
    /// running.
    pub async fn process_queue(&self) {
        let decision = {
            let mut core = self.core.lock().unwrap();
            if core.status != SchedulerStatus::Running {
                Decision::Noop
            } else if core.queue.is_empty() && core.active.is_empty() {
                core.status = SchedulerStatus::Completed;
                Decision::Finished {
                    completed: core.completed.len(),
                    errored: core.errored.len(),
                }
            } else {
                let slots = self
                    .config
                    .concurrency
                    .max(1)
                    .saturating_sub(core.active.len());
                let take = slots.min(core.queue.len());
                let mut ids = Vec::with_capacity(take);
                for _ in 0..take {
                    if let Some(id) = core.queue.pop_front() {
                        core.active.insert(id.clone());
                        ids.push(id);
                    }
                }
                if ids.is_empty() {
                    Decision::Noop
                } else {
                    Decision::Dispatch(ids)
                }
            }
        };

        match decision {
            Decision::Noop => {}
            Decision::Finished { completed, errored } => {
                info!(
                    "Batch {} drained: {} completed, {} errored",
                    self.batch_id, completed, errored
                );
                self.states.cleanup_batch(&self.batch_id).await;
                self.set_status(SchedulerStatus::Completed);
                self.emit(SchedulerEvent::Completed { completed, errored });
            }
            Decision::Dispatch(ids) => {
                debug!("Batch {} dispatching {} tasks", self.batch_id, ids.len());
                for id in ids {
                    let executor = self.executor.clone();
                    let batch_id = self.batch_id.clone();
                    let config = self.config.clone();
                    // Fire and forget: failures surface through the
                    // state manager's signals, not this call
                    tokio::spawn(async move {
                        executor.execute_one(&batch_id, &id, &config).await;
                    });
                }
            }
        }
    }

    async fn handle_task_event(self: Arc<Self>, event: TaskEvent) {
        match event {
            TaskEvent::Completed { task_id, batch_id, .. } if batch_id == self.batch_id => {
                let refill = {
                    let mut core = self.core.lock().unwrap();
                    if !core.active.remove(&task_id) {
                        return;
                    }
                    core.completed.insert(task_id);
                    self.refill_due(&core)
                };
                if refill {
                    self.process_queue().await;
                }
            }
            TaskEvent::Failed { task_id, batch_id, kind, .. } if batch_id == self.batch_id => {
                let action = {
                    let mut core = self.core.lock().unwrap();
                    if !core.active.remove(&task_id) {
                        return;
                    }
                    core.errored.insert(task_id);
                    if kind == ErrorKind::RateLimit && core.status == SchedulerStatus::Running {
                        core.status = SchedulerStatus::Throttled;
                        FailAction::Throttle
                    } else if self.refill_due(&core) {
                        FailAction::Refill
                    } else {
                        FailAction::None
                    }
                };
                match action {
                    FailAction::Throttle => self.clone().enter_throttled(),
                    FailAction::Refill => self.process_queue().await,
                    FailAction::None => {}
                }
            }
            _ => {}
        }
    }

    /// Whether this terminal signal should trigger an out-of-cycle
    /// dispatch. Event strategy always refills; timed strategy only when
    /// the run just fully drained, so the last task is not stuck waiting
    /// for the next tick.
    fn refill_due(&self, core: &SchedulerCore) -> bool {
        match self.config.scheduling_strategy {
            SchedulingStrategy::Event => true,
            SchedulingStrategy::Timed => core.queue.is_empty() && core.active.is_empty(),
        }
    }

    /// Pause the throttle window and arrange recovery: probe-driven when
    /// configured, otherwise a fixed delay.
    fn enter_throttled(self: Arc<Self>) {
        warn!("Batch {} throttled by provider", self.batch_id);
        self.set_status(SchedulerStatus::Throttled);
        self.emit(SchedulerEvent::Throttled {
            resume_in: THROTTLE_RESUME_DELAY,
        });

        let scheduler = self.clone();
        let waiter = tokio::spawn(async move {
            let deadline = Instant::now() + THROTTLE_RESUME_DELAY;

            let recovered = match (&scheduler.probe_target, scheduler.config.throttle_probe) {
                (Some(target), Some(settings)) => {
                    let probe = ThrottleProbe::new(
                        target.clone(),
                        scheduler.config.model_id.clone(),
                        settings,
                    );
                    let mut events = probe.subscribe();
                    probe.start_probing().await;
                    let outcome = loop {
                        match events.recv().await {
                            Ok(ProbeEvent::Recovered) => break true,
                            Ok(ProbeEvent::MaxRetriesReached) => break false,
                            Ok(ProbeEvent::TestResult { .. }) => continue,
                            Err(_) => break false,
                        }
                    };
                    probe.stop().await;
                    outcome
                }
                _ => false,
            };

            if !recovered {
                sleep_until(deadline).await;
            }
            scheduler.resume_from_throttle().await;
        });
        self.handles.lock().unwrap().push(waiter);
    }

    async fn resume_from_throttle(&self) {
        {
            let mut core = self.core.lock().unwrap();
            if core.status != SchedulerStatus::Throttled {
                return;
            }
            core.status = SchedulerStatus::Running;
        }
        info!("Batch {} resuming after throttle", self.batch_id);
        self.emit(SchedulerEvent::Recovered);
        self.set_status(SchedulerStatus::Running);
        self.process_queue().await;
    }

    /// Stop dispatching without disturbing queue contents
    pub async fn pause(&self) {
        {
            let mut core = self.core.lock().unwrap();
            if core.status != SchedulerStatus::Running {
                return;
            }
            core.status = SchedulerStatus::Paused;
        }
        self.emit(SchedulerEvent::Paused);
        self.set_status(SchedulerStatus::Paused);
    }

    pub async fn resume(&self) {
        {
            let mut core = self.core.lock().unwrap();
            if core.status != SchedulerStatus::Paused {
                return;
            }
            core.status = SchedulerStatus::Running;
        }
        self.emit(SchedulerEvent::Resumed);
        self.set_status(SchedulerStatus::Running);
        self.process_queue().await;
    }

    /// Append task ids to a running scheduler's queue and dispatch
    /// immediately. Supports incremental submission.
    pub async fn add_tasks(&self, task_ids: Vec<String>) {
        {
            let mut core = self.core.lock().unwrap();
            core.queue.extend(task_ids);
        }
        self.process_queue().await;
    }

    /// Cancel one task. A waiting task leaves the queue and reverts to
    /// `unsent` without the provider ever being contacted; an active task
    /// has its in-flight call aborted.
    pub async fn cancel_task(&self, task_id: &str) {
        let was_queued = {
            let mut core = self.core.lock().unwrap();
            let before = core.queue.len();
            core.queue.retain(|id| id != task_id);
            core.queue.len() != before
        };

        if was_queued {
            self.states.update_state(task_id, TaskStatus::Unsent).await;
        } else if self.core.lock().unwrap().active.contains(task_id) {
            self.executor.cancel_task(task_id).await;
        }
    }

    /// Cancel the whole run: every waiting task reverts to `unsent`,
    /// every active call is aborted.
    pub async fn cancel_all(&self) {
        let (queued, active) = {
            let mut core = self.core.lock().unwrap();
            let queued: Vec<String> = core.queue.drain(..).collect();
            let active: Vec<String> = core.active.iter().cloned().collect();
            (queued, active)
        };

        for id in queued {
            self.states.update_state(&id, TaskStatus::Unsent).await;
        }
        for id in active {
            self.executor.cancel_task(&id).await;
        }
    }

    /// Stop all timers and listeners and clear all run state. Idempotent.
    pub async fn destroy(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        let mut core = self.core.lock().unwrap();
        core.queue.clear();
        core.active.clear();
        core.status = SchedulerStatus::Idle;
    }
}
