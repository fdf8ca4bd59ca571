//! # Handler registry and execution.
//!
//! [`Executor`] resolves a handler by task type and runs it under the
//! task's deadline with cooperative cancellation and panic capture.
//!
//! ## Execution flow
//! ```text
//! execute(task, token)
//!   ├─► resolve handler by task.type        → HandlerNotFound
//!   ├─► derive child token for this attempt
//!   ├─► run under tokio::time::timeout(task.timeout)
//!   │     ├─► deadline hit   → cancel child → Timeout
//!   │     ├─► token canceled → cancel child → Canceled
//!   │     ├─► handler panic  → Panicked (diagnostic in logs)
//!   │     └─► handler result → passed through
//!   └─► (result payload | ExecError)
//! ```
//!
//! ## Rules
//! - The executor is stateless and shared by all worker fibers; the
//!   registry is read-only after construction
//! - A panic never crashes the worker fiber
//! - Child cancellation does not affect the pool-wide token

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ExecError;
use crate::task::{Payload, Task};

/// A user-supplied handler for one task type.
///
/// Receives the task and a cancellation token scoped to this attempt;
/// implementations should check the token at their own suspension points
/// and return [`ExecError::Canceled`] when it fires.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes the task's payload, returning the result payload.
    async fn handle(&self, task: &Task, ctx: CancellationToken) -> Result<Payload, ExecError>;
}

/// Blanket adapter so plain async closures can serve as handlers.
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Task, CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Payload, ExecError>> + Send,
{
    async fn handle(&self, task: &Task, ctx: CancellationToken) -> Result<Payload, ExecError> {
        (self.0)(task.clone(), ctx).await
    }
}

/// Resolves handlers by task type and executes them under a deadline.
pub struct Executor {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Executor {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for a task type, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    /// True when a handler exists for the type.
    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// All registered types, unordered.
    pub fn handler_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Executes the task's handler under `task.timeout`.
    ///
    /// `token` is the pool-wide execution context; a child token is derived
    /// per attempt so canceling one execution never affects its siblings.
    pub async fn execute(
        &self,
        task: &Task,
        token: &CancellationToken,
    ) -> Result<Payload, ExecError> {
        let Some(handler) = self.handlers.get(&task.task_type) else {
            return Err(ExecError::HandlerNotFound {
                task_type: task.task_type.clone(),
            });
        };

        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            "executing task"
        );
        let child = token.child_token();
        let started = Instant::now();

        let run = std::panic::AssertUnwindSafe(handler.handle(task, child.clone())).catch_unwind();

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                child.cancel();
                Err(ExecError::Canceled)
            }
            res = time::timeout(task.timeout, run) => match res {
                Err(_elapsed) => {
                    child.cancel();
                    Err(ExecError::Timeout { timeout: task.timeout })
                }
                Ok(Err(panic_err)) => {
                    let reason = {
                        let any = &*panic_err;
                        if let Some(msg) = any.downcast_ref::<&'static str>() {
                            (*msg).to_string()
                        } else if let Some(msg) = any.downcast_ref::<String>() {
                            msg.clone()
                        } else {
                            "unknown panic".to_string()
                        }
                    };
                    error!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        panic = %reason,
                        "task handler panicked"
                    );
                    Err(ExecError::Panicked { reason })
                }
                Ok(Ok(result)) => result,
            },
        };

        let duration = started.elapsed();
        match &outcome {
            Ok(_) => debug!(task_id = %task.id, ?duration, "task executed"),
            Err(e) if e.is_timeout() => {
                warn!(task_id = %task.id, ?duration, "task timed out")
            }
            Err(e) if e.is_canceled() => {
                warn!(task_id = %task.id, ?duration, "task canceled")
            }
            Err(e) => {
                warn!(task_id = %task.id, ?duration, error = %e, "task failed")
            }
        }
        outcome
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;
    use std::time::Duration;

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

    fn task(task_type: &str) -> Task {
        Task::new(task_type, Payload::new(), Priority::Normal).with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let ex = echo_executor();
        let token = CancellationToken::new();
        let result = ex.execute(&task("echo"), &token).await.unwrap();
        assert!(result.contains_key("echoed"));
    }

    #[tokio::test]
    async fn unknown_type_is_handler_not_found() {
        let ex = echo_executor();
        let token = CancellationToken::new();
        assert!(matches!(
            ex.execute(&task("nope"), &token).await,
            Err(ExecError::HandlerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let mut ex = Executor::new();
        ex.register(
            "slow",
            Arc::new(HandlerFn(|_task, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Payload::new())
            })),
        );
        let t = task("slow").with_timeout(Duration::from_millis(40));
        let token = CancellationToken::new();
        assert!(matches!(
            ex.execute(&t, &token).await,
            Err(ExecError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn pool_cancellation_maps_to_canceled() {
        let mut ex = Executor::new();
        ex.register(
            "wait",
            Arc::new(HandlerFn(|_task, ctx: CancellationToken| async move {
                ctx.cancelled().await;
                Err(ExecError::Canceled)
            })),
        );
        let token = CancellationToken::new();
        let t = task("wait");

        let cancel = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            })
        };
        assert!(matches!(
            ex.execute(&t, &token).await,
            Err(ExecError::Canceled)
        ));
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let mut ex = Executor::new();
        ex.register(
            "explode",
            Arc::new(HandlerFn(|_task, _ctx| async move {
                panic!("kaboom");
                #[allow(unreachable_code)]
                Ok(Payload::new())
            })),
        );
        let token = CancellationToken::new();
        match ex.execute(&task("explode"), &token).await {
            Err(ExecError::Panicked { reason }) => assert!(reason.contains("kaboom")),
            other => panic!("expected panic capture, got {other:?}"),
        }
    }
}
