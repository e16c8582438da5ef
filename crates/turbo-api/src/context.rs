//! Per-request state
//!
//! A [`RequestContext`] is created when a request arrives and owned by the
//! dispatch future for that request alone. It carries the lifecycle stage,
//! the dependency cache and the background task queue.
//!
//! If the dispatch future is dropped before the queue is handed off (client
//! disconnect, timeout), the context spawns whatever is still queued.

use crate::background::BackgroundTasks;
use crate::executor::BlockingPool;
use crate::request::Request;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// A resolved dependency value
pub type Resolved = Arc<dyn Any + Send + Sync>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Request lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Matched,
    ParamsBound,
    DependenciesResolved,
    Invoking,
    ResponseReady,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Matched => "matched",
            Stage::ParamsBound => "params_bound",
            Stage::DependenciesResolved => "dependencies_resolved",
            Stage::Invoking => "invoking",
            Stage::ResponseReady => "response_ready",
            Stage::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-owner state for one request
pub struct RequestContext {
    id: u64,
    request: Arc<Request>,
    stage: Stage,
    cache: HashMap<String, Resolved>,
    background: BackgroundTasks,
    pool: Option<BlockingPool>,
}

impl RequestContext {
    pub fn new(request: Request) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            request: Arc::new(request),
            stage: Stage::Received,
            cache: HashMap::new(),
            background: BackgroundTasks::new(),
            pool: None,
        }
    }

    /// Pool used for blocking tasks still queued when the context drops
    pub(crate) fn with_pool(mut self, pool: BlockingPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Process-unique request id, used in log fields
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn advance(&mut self, stage: Stage) {
        trace!(request_id = self.id, from = %self.stage, to = %stage, "Stage transition");
        self.stage = stage;
    }

    pub fn cached(&self, dependency: &str) -> Option<&Resolved> {
        self.cache.get(dependency)
    }

    pub fn cache(&mut self, dependency: impl Into<String>, value: Resolved) {
        self.cache.insert(dependency.into(), value);
    }

    /// Snapshot of resolved values for the given names
    pub fn resolved_for<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> HashMap<String, Resolved> {
        names
            .into_iter()
            .filter_map(|name| self.cache.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        if self.background.is_empty() {
            return;
        }
        debug!(
            request_id = self.id,
            stage = %self.stage,
            count = self.background.len(),
            "Request dropped with queued background tasks"
        );
        let pool = self.pool.take().unwrap_or_else(|| BlockingPool::new(Some(1)));
        drop(self.background.drain(pool));
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("path", &self.request.path)
            .field("stage", &self.stage)
            .field("cached", &self.cache.keys().collect::<Vec<_>>())
            .finish()
    }
}
