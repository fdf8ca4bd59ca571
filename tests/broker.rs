//! End-to-end broker scenarios over the in-memory store: happy path,
//! retry-then-succeed, quarantine, cancellation, delayed promotion, orphan
//! reclaim, pause/resume, and shutdown abandonment.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use taskbroker::{
    Bus, Config, DeadLetterQueue, EventKind, ExecError, Executor, Handler, HandlerFn, MemoryStore,
    Payload, Priority, Scheduler, StateMachine, Store, Task, TaskQueue, TaskState, WorkerPool,
    WorkerRegistry,
};

/// Shared fixture: store, bus, queue, DLQ, and a config tuned for fast tests.
struct Broker {
    cfg: Config,
    store: Arc<dyn Store>,
    bus: Bus,
    queue: Arc<TaskQueue>,
    dlq: Arc<DeadLetterQueue>,
}

impl Broker {
    async fn new() -> Self {
        let mut cfg = Config::default();
        cfg.queue.block_timeout = Duration::from_millis(50);
        cfg.queue.claim_min_idle = Duration::from_millis(150);
        cfg.queue.recovery_interval = Duration::from_millis(100);
        cfg.queue.retry.initial_backoff = Duration::from_millis(1);
        cfg.queue.retry.max_backoff = Duration::from_millis(10);
        cfg.queue.retry.jitter_factor = 0.0;
        cfg.worker.concurrency = 2;
        cfg.worker.heartbeat_interval = Duration::from_millis(50);
        cfg.worker.heartbeat_timeout = Duration::from_millis(400);
        cfg.worker.shutdown_timeout = Duration::from_secs(2);

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = Bus::new(256);
        let queue = Arc::new(
            TaskQueue::new(store.clone(), &cfg.queue, bus.clone())
                .await
                .unwrap(),
        );
        let dlq = Arc::new(DeadLetterQueue::new(store.clone()));

        Self {
            cfg,
            store,
            bus,
            queue,
            dlq,
        }
    }

    fn pool(&self, executor: Executor) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            &self.cfg,
            self.store.clone(),
            self.queue.clone(),
            self.dlq.clone(),
            Arc::new(executor),
            self.bus.clone(),
        ))
    }

    /// Polls the task record until `pred` holds or ~3s elapse.
    async fn wait_for_task(&self, task_id: &str, pred: impl Fn(&Task) -> bool) -> Task {
        for _ in 0..60 {
            if let Ok(task) = self.queue.get_task(task_id).await {
                if pred(&task) {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {task_id} did not reach the expected state in time");
    }

    async fn pending_total(&self) -> u64 {
        self.queue.queue_depths().await.unwrap().values().sum()
    }
}

fn payload(kv: &[(&str, &str)]) -> Payload {
    kv.iter()
        .map(|(k, v)| ((*k).to_string(), serde_json::Value::String((*v).to_string())))
        .collect()
}

fn echo_executor() -> Executor {
    let mut ex = Executor::new();
    ex.register(
        "echo",
        Arc::new(HandlerFn(|task: Task, _ctx| async move {
            let mut out = Payload::new();
            out.insert("echoed".into(), serde_json::Value::Object(task.payload));
            Ok(out)
        })),
    );
    ex
}

/// Fails the first `failures` executions, then succeeds.
struct Flaky {
    remaining: AtomicU32,
}

#[async_trait::async_trait]
impl Handler for Flaky {
    async fn handle(&self, _task: &Task, _ctx: CancellationToken) -> Result<Payload, ExecError> {
        if self.remaining.load(Ordering::SeqCst) > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(ExecError::failed("boom"));
        }
        Ok(Payload::new())
    }
}

#[tokio::test]
async fn happy_path_completes_with_result() {
    let broker = Broker::new().await;
    let pool = broker.pool(echo_executor());
    let mut events = broker.bus.subscribe();
    pool.start().await;

    let task = Task::new("echo", payload(&[("m", "hi")]), Priority::High)
        .with_max_retries(3)
        .with_timeout(Duration::from_secs(5));
    broker.queue.submit(&task).await.unwrap();

    let done = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Completed)
        .await;
    pool.stop().await;

    assert_eq!(done.attempts, 1);
    assert_eq!(done.worker_id.as_deref(), Some(pool.id()));
    let result = done.result.expect("result set on completion");
    assert_eq!(
        result["echoed"]["m"],
        serde_json::Value::String("hi".into())
    );
    assert!(done.error.is_none());
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());
    assert_eq!(broker.pending_total().await, 0);

    // submitted → started → completed, in order.
    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if ev.task.as_deref() == Some(task.id.as_str()) {
            seen.push(ev.kind);
        }
    }
    assert_eq!(
        seen,
        vec![
            EventKind::TaskSubmitted,
            EventKind::TaskStarted,
            EventKind::TaskCompleted
        ]
    );
}

#[tokio::test]
async fn retry_then_succeed_counts_attempts() {
    let broker = Broker::new().await;
    let mut ex = Executor::new();
    ex.register(
        "flaky",
        Arc::new(Flaky {
            remaining: AtomicU32::new(2),
        }),
    );
    let pool = broker.pool(ex);
    pool.start().await;

    let task = Task::new("flaky", Payload::new(), Priority::Normal).with_max_retries(2);
    broker.queue.submit(&task).await.unwrap();

    let done = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Completed)
        .await;
    pool.stop().await;

    assert_eq!(done.attempts, 3);
    assert!(done.error.is_none());
    assert!(done.result.is_some());
    assert_eq!(broker.pending_total().await, 0);
    assert!(!broker.dlq.contains(&task.id).await.unwrap());
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_letter() {
    let broker = Broker::new().await;
    let mut ex = Executor::new();
    ex.register(
        "flaky",
        Arc::new(Flaky {
            remaining: AtomicU32::new(u32::MAX),
        }),
    );
    let pool = broker.pool(ex);
    pool.start().await;

    let task = Task::new("flaky", Payload::new(), Priority::Normal).with_max_retries(1);
    broker.queue.submit(&task).await.unwrap();

    let dead = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::DeadLetter)
        .await;
    pool.stop().await;

    assert_eq!(dead.attempts, 2);
    assert_eq!(dead.error.as_deref(), Some("boom"));
    assert!(broker.dlq.contains(&task.id).await.unwrap());

    let entries = broker.dlq.list(10, None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "max retries exceeded");
    assert_eq!(entries[0].original_error.as_deref(), Some("boom"));
    assert_eq!(broker.pending_total().await, 0);
}

#[tokio::test]
async fn cancelled_task_is_never_executed() {
    let broker = Broker::new().await;

    let task = Task::new("echo", Payload::new(), Priority::Normal);
    broker.queue.submit(&task).await.unwrap();
    broker.queue.cancel(&task.id).await.unwrap();

    let pool = broker.pool(echo_executor());
    pool.start().await;

    // The stale stream entry is acked-and-discarded on claim because the
    // state machine rejects start on a cancelled record.
    for _ in 0..30 {
        if broker.pending_total().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pool.stop().await;

    let record = broker.queue.get_task(&task.id).await.unwrap();
    assert_eq!(record.state, TaskState::Cancelled);
    assert_eq!(record.attempts, 0);
    assert!(record.result.is_none());
    assert_eq!(broker.pending_total().await, 0);
}

#[tokio::test]
async fn scheduled_task_is_promoted_when_due() {
    let broker = Broker::new().await;
    let scheduler = Arc::new(
        Scheduler::new(broker.queue.clone()).with_poll_interval(Duration::from_millis(50)),
    );

    let task = Task::new("echo", Payload::new(), Priority::Normal)
        .with_scheduled_at(chrono::Utc::now() + chrono::Duration::milliseconds(300));
    scheduler.schedule(&task).await.unwrap();

    // Not claimable before the due time.
    assert!(broker.queue.claim_next("probe").await.unwrap().is_none());
    assert_eq!(
        broker.queue.get_task(&task.id).await.unwrap().state,
        TaskState::Scheduled
    );

    let token = CancellationToken::new();
    let handle = scheduler.clone().spawn(token.clone());

    let promoted = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Pending)
        .await;
    token.cancel();
    handle.await.unwrap();

    assert_eq!(promoted.state, TaskState::Pending);
    assert_eq!(scheduler.scheduled_count().await.unwrap(), 0);
    let (claimed, _) = broker.queue.claim_next("probe").await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
}

#[tokio::test]
async fn orphaned_task_is_reclaimed_and_finished() {
    let broker = Broker::new().await;

    let task = Task::new("echo", Payload::new(), Priority::Normal);
    broker.queue.submit(&task).await.unwrap();

    // Pool 1 claims and "crashes": record says running, entry never acked.
    let (mut claimed, _message_id) = broker.queue.claim_next("pool-1").await.unwrap().unwrap();
    StateMachine::new(&mut claimed).start("pool-1").unwrap();
    broker.queue.update(&claimed).await.unwrap();
    assert_eq!(broker.pending_total().await, 1);

    // Pool 2's recovery loop reclaims after claim_min_idle and re-runs it.
    let pool2 = broker.pool(echo_executor());
    pool2.start().await;

    let done = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Completed)
        .await;
    pool2.stop().await;

    // The attempt counter spans both claims.
    assert_eq!(done.attempts, 2);
    assert_eq!(done.worker_id.as_deref(), Some(pool2.id()));
    assert_eq!(broker.pending_total().await, 0);
}

#[tokio::test]
async fn remote_pause_stops_claiming_until_resume() {
    let broker = Broker::new().await;
    let pool = broker.pool(echo_executor());
    let registry = WorkerRegistry::new(broker.store.clone());

    registry.pause(pool.id()).await.unwrap();
    pool.start().await;

    let task = Task::new("echo", Payload::new(), Priority::Normal);
    broker.queue.submit(&task).await.unwrap();

    // Paused worker leaves the task untouched.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        broker.queue.get_task(&task.id).await.unwrap().state,
        TaskState::Pending
    );

    registry.resume(pool.id()).await.unwrap();
    let done = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Completed)
        .await;
    pool.stop().await;
    assert_eq!(done.attempts, 1);
}

#[tokio::test]
async fn shutdown_abandons_stuck_executions_for_reclaim() {
    let broker = Broker::new().await;
    let mut cfg = broker.cfg.clone();
    cfg.worker.shutdown_timeout = Duration::from_millis(100);

    let mut ex = Executor::new();
    ex.register(
        "stuck",
        Arc::new(HandlerFn(|_task, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Payload::new())
        })),
    );
    let pool = Arc::new(WorkerPool::new(
        &cfg,
        broker.store.clone(),
        broker.queue.clone(),
        broker.dlq.clone(),
        Arc::new(ex),
        broker.bus.clone(),
    ));
    pool.start().await;

    let task = Task::new("stuck", Payload::new(), Priority::Normal);
    broker.queue.submit(&task).await.unwrap();
    broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Running)
        .await;

    pool.stop().await;

    // The execution was abandoned: entry still pending, record still
    // running, ready for another pool's recovery loop.
    assert_eq!(broker.pending_total().await, 1);
    assert_eq!(
        broker.queue.get_task(&task.id).await.unwrap().state,
        TaskState::Running
    );
}

#[tokio::test]
async fn dead_letter_replay_reaches_completion() {
    let broker = Broker::new().await;
    let mut ex = Executor::new();
    // Fails the single allowed attempt, then succeeds after replay.
    ex.register(
        "flaky",
        Arc::new(Flaky {
            remaining: AtomicU32::new(1),
        }),
    );
    let pool = broker.pool(ex);
    pool.start().await;

    let task = Task::new("flaky", Payload::new(), Priority::Normal).with_max_retries(0);
    broker.queue.submit(&task).await.unwrap();

    broker
        .wait_for_task(&task.id, |t| t.state == TaskState::DeadLetter)
        .await;
    assert_eq!(broker.dlq.size().await.unwrap(), 1);

    broker.dlq.retry(&broker.queue, &task.id, None).await.unwrap();
    let done = broker
        .wait_for_task(&task.id, |t| t.state == TaskState::Completed)
        .await;
    pool.stop().await;

    assert_eq!(done.attempts, 1);
    assert_eq!(broker.dlq.size().await.unwrap(), 0);
    assert!(!broker.dlq.contains(&task.id).await.unwrap());
}
