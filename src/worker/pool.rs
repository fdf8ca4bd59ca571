//! # Worker pool: concurrency, settlement, recovery, shutdown.
//!
//! A [`WorkerPool`] is one process participating in the consumer group as a
//! single named consumer. It owns `N` symmetric worker fibers behind a
//! concurrency gate, a heartbeat fiber, and a recovery fiber.
//!
//! ## Fiber loop
//! ```text
//! worker fiber (xN):
//! loop {
//!   ├─► check stop signal (fast-path)
//!   ├─► local pause?  → wait on resume / stop
//!   ├─► remote pause? → sleep ~1s, recheck
//!   ├─► acquire gate slot (cancellable)
//!   ├─► claim_next(block_timeout)
//!   ├─► start → persist → execute → settle
//!   └─► release slot
//! }
//!
//! settlement:
//!   success            → complete, persist, ack
//!   failure, budget    → retrying, persist, re-submit (immediate), ack old
//!   failure, exhausted → failed, persist, DLQ add, ack
//!   canceled by stop   → abandoned (PEL entry reclaimed elsewhere)
//! ```
//!
//! ## Rules
//! - Attempts are counted by `start`; a retry re-submit preserves the
//!   counter so it spans claims
//! - The stop signal blocks new claims first; in-flight executions get
//!   `shutdown_timeout` of grace, then are cancelled and abandoned
//! - A task whose record rejects `start` (e.g. cancelled) is acked and
//!   discarded
//! - Execution failures never crash the worker fiber

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ExecError;
use crate::events::{Bus, Event, EventKind};
use crate::policies::RetryPolicy;
use crate::queue::{DeadLetterQueue, TaskQueue};
use crate::store::Store;
use crate::task::{StateMachine, Task};
use crate::worker::{Executor, Heartbeat, WorkerRegistry};

/// Observable pool state; non-authoritative (the remote pause key is the
/// authoritative pause signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Created, not yet started.
    Idle,
    /// Claiming and executing.
    Busy,
    /// Not claiming new work; in-flight work continues.
    Paused,
    /// Stop signal fired; draining.
    ShuttingDown,
}

impl PoolState {
    /// Returns the stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Idle => "idle",
            PoolState::Busy => "busy",
            PoolState::Paused => "paused",
            PoolState::ShuttingDown => "shutting_down",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => PoolState::Busy,
            2 => PoolState::Paused,
            3 => PoolState::ShuttingDown,
            _ => PoolState::Idle,
        }
    }
}

struct InFlight {
    #[allow(dead_code)]
    message_id: String,
    started_at: std::time::Instant,
}

/// A pool of worker fibers driving fetch → execute → settle.
pub struct WorkerPool {
    id: String,
    queue: Arc<TaskQueue>,
    dlq: Arc<DeadLetterQueue>,
    executor: Arc<Executor>,
    heartbeat: Arc<Heartbeat>,
    registry: WorkerRegistry,
    retry: RetryPolicy,
    bus: Bus,
    concurrency: usize,
    shutdown_timeout: Duration,
    recovery_interval: Duration,
    state: AtomicU8,
    in_flight: DashMap<String, InFlight>,
    gate: Arc<Semaphore>,
    /// Blocks new claims when cancelled; first stage of shutdown.
    claim_token: CancellationToken,
    /// Cancels in-flight executions; fired only after the grace period.
    exec_token: CancellationToken,
    paused: watch::Sender<bool>,
    fibers: Mutex<JoinSet<()>>,
    heartbeat_fiber: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool over the given collaborators.
    ///
    /// A missing `worker.id` gets a fresh opaque id at startup.
    pub fn new(
        cfg: &Config,
        store: Arc<dyn Store>,
        queue: Arc<TaskQueue>,
        dlq: Arc<DeadLetterQueue>,
        executor: Arc<Executor>,
        bus: Bus,
    ) -> Self {
        let id = cfg
            .worker
            .id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]));

        let heartbeat = Arc::new(Heartbeat::new(
            store.clone(),
            id.clone(),
            cfg.worker.heartbeat_interval,
            cfg.worker.heartbeat_timeout,
            cfg.worker.concurrency,
        ));

        let (paused, _) = watch::channel(false);

        Self {
            id,
            registry: WorkerRegistry::new(store),
            heartbeat,
            queue,
            dlq,
            executor,
            retry: cfg.queue.retry,
            bus,
            concurrency: cfg.worker.concurrency.max(1),
            shutdown_timeout: cfg.worker.shutdown_timeout,
            recovery_interval: cfg.queue.recovery_interval,
            state: AtomicU8::new(0),
            in_flight: DashMap::new(),
            gate: Arc::new(Semaphore::new(cfg.worker.concurrency.max(1))),
            claim_token: CancellationToken::new(),
            exec_token: CancellationToken::new(),
            paused,
            fibers: Mutex::new(JoinSet::new()),
            heartbeat_fiber: Mutex::new(None),
        }
    }

    /// The pool's consumer id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current observable state.
    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: PoolState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Number of executions in flight.
    pub fn active_tasks(&self) -> usize {
        self.in_flight.len()
    }

    /// Spawns the worker, recovery, and heartbeat fibers.
    pub async fn start(self: &Arc<Self>) {
        self.set_state(PoolState::Busy);
        self.heartbeat.update_state(PoolState::Busy.as_str()).await;

        {
            let hb = Arc::clone(&self.heartbeat);
            let token = self.exec_token.clone();
            let mut slot = self.heartbeat_fiber.lock().await;
            *slot = Some(tokio::spawn(async move { hb.run(token).await }));
        }

        let mut fibers = self.fibers.lock().await;
        for n in 0..self.concurrency {
            let pool = Arc::clone(self);
            fibers.spawn(async move { pool.worker_loop(n).await });
        }
        {
            let pool = Arc::clone(self);
            fibers.spawn(async move { pool.recovery_loop().await });
        }

        self.bus
            .publish(Event::now(EventKind::WorkerJoined).with_worker(&self.id));
        info!(
            worker_id = %self.id,
            concurrency = self.concurrency,
            "worker pool started"
        );
    }

    /// Graceful shutdown: stop claiming, wait for in-flight work up to
    /// `shutdown_timeout`, then cancel and abandon what remains.
    ///
    /// Abandoned messages stay in the PEL and are reclaimed by another
    /// pool's recovery loop.
    pub async fn stop(&self) {
        self.set_state(PoolState::ShuttingDown);
        self.heartbeat
            .update_state(PoolState::ShuttingDown.as_str())
            .await;
        self.claim_token.cancel();

        let mut fibers = self.fibers.lock().await;
        let graceful = time::timeout(self.shutdown_timeout, async {
            while fibers.join_next().await.is_some() {}
        })
        .await;

        if graceful.is_err() {
            warn!(
                worker_id = %self.id,
                abandoned = self.in_flight.len(),
                "shutdown grace exceeded; abandoning in-flight executions"
            );
        }

        // Cancel whatever is still running; fibers observe this promptly.
        self.exec_token.cancel();
        while fibers.join_next().await.is_some() {}

        self.bus
            .publish(Event::now(EventKind::WorkerLeft).with_worker(&self.id));
        if let Some(hb) = self.heartbeat_fiber.lock().await.take() {
            let _ = hb.await;
        }
        info!(worker_id = %self.id, "worker pool stopped");
    }

    /// Local pause: fibers stop claiming after their current iteration;
    /// in-flight work continues to completion.
    pub async fn pause(&self) {
        if self.state() == PoolState::Busy {
            self.set_state(PoolState::Paused);
            self.paused.send_replace(true);
            self.heartbeat.update_state(PoolState::Paused.as_str()).await;
            self.bus
                .publish(Event::now(EventKind::WorkerPaused).with_worker(&self.id));
            info!(worker_id = %self.id, "worker pool paused");
        }
    }

    /// Resumes claiming after a local pause.
    pub async fn resume(&self) {
        if self.state() == PoolState::Paused {
            self.set_state(PoolState::Busy);
            self.paused.send_replace(false);
            self.heartbeat.update_state(PoolState::Busy.as_str()).await;
            self.bus
                .publish(Event::now(EventKind::WorkerResumed).with_worker(&self.id));
            info!(worker_id = %self.id, "worker pool resumed");
        }
    }

    async fn worker_loop(self: Arc<Self>, fiber: usize) {
        debug!(worker_id = %self.id, fiber, "worker fiber started");
        let mut pause_rx = self.paused.subscribe();

        loop {
            if self.claim_token.is_cancelled() {
                break;
            }

            // Local pause: block on the resume signal.
            let locally_paused = *pause_rx.borrow_and_update();
            if locally_paused {
                select! {
                    _ = self.claim_token.cancelled() => break,
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            // Remote pause: authoritative per-worker key in the store.
            match self.registry.is_paused(&self.id).await {
                Ok(true) => {
                    select! {
                        _ = self.claim_token.cancelled() => break,
                        _ = time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "pause check failed");
                    select! {
                        _ = self.claim_token.cancelled() => break,
                        _ = time::sleep(Duration::from_millis(500)) => continue,
                    }
                }
            }

            let permit = select! {
                _ = self.claim_token.cancelled() => break,
                permit = self.gate.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_closed) => break,
                },
            };

            let claimed = select! {
                _ = self.claim_token.cancelled() => {
                    drop(permit);
                    break;
                }
                claimed = self.queue.claim_next(&self.id) => claimed,
            };

            match claimed {
                Ok(Some((task, message_id))) => {
                    self.process(task, message_id).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = e.as_label(), "claim failed");
                    select! {
                        _ = self.claim_token.cancelled() => { drop(permit); break; }
                        _ = time::sleep(Duration::from_millis(500)) => {}
                    }
                }
            }
            drop(permit);
        }
        debug!(worker_id = %self.id, fiber, "worker fiber stopped");
    }

    /// Runs one claimed task through start → execute → settle.
    async fn process(&self, mut task: Task, message_id: String) {
        if let Err(e) = StateMachine::new(&mut task).start(&self.id) {
            // Typically a task cancelled while waiting in the stream:
            // discard the entry, the record stays authoritative.
            debug!(
                task_id = %task.id,
                error = e.as_label(),
                "claimed task rejected start; discarding entry"
            );
            self.queue.ack(&task, &message_id).await.ok();
            return;
        }
        if let Err(e) = self.queue.update(&task).await {
            error!(task_id = %task.id, error = e.as_label(), "failed to persist running state");
        }

        self.in_flight.insert(
            task.id.clone(),
            InFlight {
                message_id: message_id.clone(),
                started_at: std::time::Instant::now(),
            },
        );
        self.heartbeat.update_active_tasks(self.in_flight.len()).await;
        self.bus.publish(
            Event::now(EventKind::TaskStarted)
                .with_task(&task.id)
                .with_task_type(&task.task_type)
                .with_worker(&self.id)
                .with_attempt(task.attempts),
        );

        let outcome = self.executor.execute(&task, &self.exec_token).await;

        match outcome {
            Ok(result) => self.settle_success(&mut task, &message_id, result).await,
            Err(ExecError::Canceled) if self.exec_token.is_cancelled() => {
                // Abandoned by shutdown: no ack, the PEL entry will be
                // reclaimed by another pool.
                warn!(task_id = %task.id, "execution abandoned on shutdown");
            }
            Err(e) => self.settle_failure(&mut task, &message_id, e).await,
        }

        self.in_flight.remove(&task.id);
        self.heartbeat.update_active_tasks(self.in_flight.len()).await;
    }

    async fn settle_success(&self, task: &mut Task, message_id: &str, result: crate::task::Payload) {
        if let Err(e) = StateMachine::new(task).complete(result) {
            error!(task_id = %task.id, error = e.as_label(), "failed to complete task");
            return;
        }
        if let Err(e) = self.queue.update(task).await {
            error!(task_id = %task.id, error = e.as_label(), "failed to persist completion");
        }
        if let Err(e) = self.queue.ack(task, message_id).await {
            error!(task_id = %task.id, error = e.as_label(), "failed to ack completion");
        }

        self.bus.publish(
            Event::now(EventKind::TaskCompleted)
                .with_task(&task.id)
                .with_task_type(&task.task_type)
                .with_attempt(task.attempts),
        );
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempts = task.attempts,
            "task completed"
        );
    }

    async fn settle_failure(&self, task: &mut Task, message_id: &str, exec_err: ExecError) {
        warn!(
            task_id = %task.id,
            attempts = task.attempts,
            error = %exec_err,
            "task execution failed"
        );
        self.bus.publish(
            Event::now(EventKind::TaskFailed)
                .with_task(&task.id)
                .with_task_type(&task.task_type)
                .with_attempt(task.attempts)
                .with_error(exec_err.to_string()),
        );

        if task.can_retry() {
            if let Err(e) = StateMachine::new(task).retry() {
                error!(task_id = %task.id, error = e.as_label(), "failed to enter retrying");
            }
            task.error = Some(exec_err.to_string());
            if let Err(e) = self.queue.update(task).await {
                error!(task_id = %task.id, error = e.as_label(), "failed to persist failure");
            }

            let delay = self.retry.backoff(task.attempts);

            // Immediate re-submit: the stream entry comes back right away,
            // the computed delay is advisory for handlers and observers.
            task.reset_for_requeue();
            if let Err(e) = self.queue.submit(task).await {
                error!(task_id = %task.id, error = e.as_label(), "failed to re-submit for retry");
            }
            if let Err(e) = self.queue.ack(task, message_id).await {
                error!(task_id = %task.id, error = e.as_label(), "failed to ack after retry");
            }

            self.bus.publish(
                Event::now(EventKind::TaskRetrying)
                    .with_task(&task.id)
                    .with_task_type(&task.task_type)
                    .with_attempt(task.attempts)
                    .with_delay(delay),
            );
        } else {
            if let Err(e) = StateMachine::new(task).fail(exec_err.to_string()) {
                error!(task_id = %task.id, error = e.as_label(), "failed to enter failed");
            }
            if let Err(e) = self.queue.update(task).await {
                error!(task_id = %task.id, error = e.as_label(), "failed to persist failure");
            }
            if let Err(e) = self.dlq.add(&self.queue, task, "max retries exceeded").await {
                error!(task_id = %task.id, error = e.as_label(), "failed to quarantine task");
            }
            if let Err(e) = self.queue.ack(task, message_id).await {
                error!(task_id = %task.id, error = e.as_label(), "failed to ack after quarantine");
            }
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        let period = self.recovery_interval;
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            select! {
                _ = self.claim_token.cancelled() => break,
                _ = ticker.tick() => self.recover_orphans().await,
            }
        }
    }

    /// One reclaim pass plus a queue-depth snapshot.
    async fn recover_orphans(&self) {
        match self.queue.reclaim_orphans(&self.id).await {
            Err(e) => {
                error!(worker_id = %self.id, error = e.as_label(), "orphan reclaim failed");
            }
            Ok(reclaimed) => {
                for (mut task, old_message_id) in reclaimed {
                    info!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        "recovered orphaned task"
                    );

                    // Preserve the attempt counter: it spans claims.
                    task.reset_for_requeue();
                    if let Err(e) = self.queue.submit(&task).await {
                        error!(task_id = %task.id, error = e.as_label(), "failed to re-submit orphan");
                        continue;
                    }
                    if let Err(e) = self.queue.ack(&task, &old_message_id).await {
                        error!(task_id = %task.id, error = e.as_label(), "failed to ack orphan");
                    }
                }
            }
        }

        if let Ok(depths) = self.queue.queue_depths().await {
            self.bus
                .publish(Event::now(EventKind::QueueDepth).with_depths(depths));
        }
    }

    /// Age of the oldest in-flight execution, if any.
    pub fn oldest_in_flight(&self) -> Option<Duration> {
        self.in_flight
            .iter()
            .map(|e| e.value().started_at.elapsed())
            .max()
    }
}
