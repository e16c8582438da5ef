//! Background tasks for post-response processing
//!
//! Handlers and dependencies queue work on the request's [`BackgroundTasks`]
//! handle. Once the response body has been handed to the transport, the
//! queue is drained strictly in registration order, one task at a time.
//!
//! A failing, panicking or timed-out task is logged and the next task still
//! runs. A queue abandoned mid-flight is spawned from a `Drop`: the request
//! context's while the handler is still running, [`PendingTasks`]' after the
//! hand-off.
//!
//! ```rust
//! use turbo_api::background::BackgroundTasks;
//!
//! let tasks = BackgroundTasks::new();
//! tasks.add_task("send_welcome", || async move {
//!     // deliver the email
//!     Ok(())
//! });
//! tasks.add_blocking("write_audit", || Ok(()));
//! assert_eq!(tasks.len(), 2);
//! ```

use crate::executor::{panic_message, BlockingPool};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Boxed task future
pub type BoxedTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type BlockingFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

enum TaskKind {
    Async(BoxedTask),
    Blocking(BlockingFn),
}

struct QueuedTask {
    name: String,
    kind: TaskKind,
    timeout: Option<Duration>,
}

/// How one task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    TimedOut,
}

// ============================================================================
// Queue handle
// ============================================================================

/// Per-request task queue
///
/// Cloning shares the queue, so a handle can be passed into dependencies and
/// handlers alike.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    queue: Arc<Mutex<Vec<QueuedTask>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an async task
    pub fn add_task<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(name.into(), TaskKind::Async(Box::pin(async move { task().await })), None);
    }

    /// Queue an async task that is abandoned after `timeout`
    pub fn add_task_with_timeout<F, Fut>(&self, name: impl Into<String>, timeout: Duration, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(
            name.into(),
            TaskKind::Async(Box::pin(async move { task().await })),
            Some(timeout),
        );
    }

    /// Queue a blocking task; it runs on the blocking pool
    pub fn add_blocking<F>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.push(name.into(), TaskKind::Blocking(Box::new(task)), None);
    }

    fn push(&self, name: String, kind: TaskKind, timeout: Option<Duration>) {
        self.queue.lock().push(QueuedTask { name, kind, timeout });
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Names of queued tasks, in run order
    pub fn names(&self) -> Vec<String> {
        self.queue.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Detach the queued tasks for execution
    pub(crate) fn drain(&self, pool: BlockingPool) -> PendingTasks {
        PendingTasks {
            tasks: std::mem::take(&mut *self.queue.lock()),
            pool,
        }
    }
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("task_count", &self.len())
            .finish()
    }
}

// ============================================================================
// Pending tasks
// ============================================================================

/// Tasks detached from a finished request
///
/// Call [`run`](Self::run) or [`spawn`](Self::spawn) once the response is
/// out. Dropping it unrun spawns the tasks on the current runtime.
#[must_use = "pending background tasks run when spawned or dropped"]
pub struct PendingTasks {
    tasks: Vec<QueuedTask>,
    pool: BlockingPool,
}

impl PendingTasks {
    pub fn empty() -> Self {
        Self {
            tasks: Vec::new(),
            pool: BlockingPool::new(Some(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task in order and report how each ended
    pub async fn run(mut self) -> Vec<TaskOutcome> {
        let tasks = std::mem::take(&mut self.tasks);
        run_all(tasks, self.pool.clone()).await
    }

    /// Run on a detached runtime task
    pub fn spawn(mut self) -> Option<JoinHandle<Vec<TaskOutcome>>> {
        if self.tasks.is_empty() {
            return None;
        }
        let tasks = std::mem::take(&mut self.tasks);
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(run_all(tasks, pool))),
            Err(_) => {
                warn!(count = tasks.len(), "No runtime available, background tasks dropped");
                None
            }
        }
    }
}

impl Drop for PendingTasks {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let tasks = std::mem::take(&mut self.tasks);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(count = tasks.len(), "Spawning background tasks from dropped request");
                handle.spawn(run_all(tasks, self.pool.clone()));
            }
            Err(_) => {
                warn!(count = tasks.len(), "No runtime available, background tasks dropped");
            }
        }
    }
}

impl fmt::Debug for PendingTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTasks")
            .field("task_count", &self.tasks.len())
            .finish()
    }
}

async fn run_all(tasks: Vec<QueuedTask>, pool: BlockingPool) -> Vec<TaskOutcome> {
    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        let name = task.name;
        debug!(task = %name, "Running background task");

        let outcome = run_one(task.kind, task.timeout, &pool).await;
        match &outcome {
            TaskOutcome::Completed => {}
            TaskOutcome::Failed(e) => error!(task = %name, error = %e, "Background task failed"),
            TaskOutcome::Panicked(e) => error!(task = %name, panic = %e, "Background task panicked"),
            TaskOutcome::TimedOut => error!(task = %name, "Background task timed out"),
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn run_one(kind: TaskKind, timeout: Option<Duration>, pool: &BlockingPool) -> TaskOutcome {
    let work = async move {
        match kind {
            TaskKind::Async(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(e)) => TaskOutcome::Failed(format!("{:#}", e)),
                Err(payload) => TaskOutcome::Panicked(panic_message(&*payload)),
            },
            TaskKind::Blocking(func) => match pool.run(func).await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(e)) => TaskOutcome::Failed(format!("{:#}", e)),
                Err(e) => TaskOutcome::Panicked(e.to_string()),
            },
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .unwrap_or(TaskOutcome::TimedOut),
        None => work.await,
    }
}
