//! Dependency injection
//!
//! Dependencies are named callables that may require other dependencies,
//! forming a DAG. The container checks the graph once at build time (DFS
//! with a visiting set, so a cycle is a clean [`RegistrationError`]) and
//! computes a post-order [`ResolutionPlan`] per route. At request time the
//! plan is walked leaves first; every value lands in the request's cache, so
//! a dependency shared by several consumers runs once per request.

use crate::background::BackgroundTasks;
use crate::context::{RequestContext, Resolved};
use crate::error::{ApiError, ApiResult, RegistrationError};
use crate::executor::{panic_message, BlockingPool, PoolError};
use crate::params::{BoundParams, ParameterSpec};
use crate::request::Request;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;
use turbo_validation::Value;

/// Boxed future for async callables
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Inputs
// ============================================================================

/// Everything a handler or dependency can read
#[derive(Clone)]
pub struct Inputs {
    request: Arc<Request>,
    params: Arc<BoundParams>,
    resolved: HashMap<String, Resolved>,
    background: BackgroundTasks,
}

impl Inputs {
    pub fn new(
        request: Arc<Request>,
        params: Arc<BoundParams>,
        resolved: HashMap<String, Resolved>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            request,
            params,
            resolved,
            background,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &BoundParams {
        &self.params
    }

    /// A bound parameter by declared name
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// A resolved dependency of type `T`
    pub fn dep<T: Any + Send + Sync>(&self, name: &str) -> ApiResult<Arc<T>> {
        let value = self
            .resolved
            .get(name)
            .ok_or_else(|| ApiError::Internal(format!("dependency `{}` was not resolved", name)))?;
        value.clone().downcast::<T>().map_err(|_| {
            ApiError::Internal(format!(
                "dependency `{}` is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }
}

impl fmt::Debug for Inputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inputs")
            .field("path", &self.request.path)
            .field("params", &self.params)
            .field("resolved", &self.resolved.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Dependency nodes
// ============================================================================

type SyncDependencyFn = Arc<dyn Fn(&Inputs) -> ApiResult<Resolved> + Send + Sync>;
type AsyncDependencyFn = Arc<dyn Fn(Inputs) -> BoxFuture<'static, ApiResult<Resolved>> + Send + Sync>;

/// Sync or async callable, fixed at registration
#[derive(Clone)]
pub enum DependencyKind {
    Sync(SyncDependencyFn),
    Async(AsyncDependencyFn),
}

/// A named dependency
#[derive(Clone)]
pub struct DependencyNode {
    name: String,
    params: Vec<ParameterSpec>,
    depends_on: Vec<String>,
    kind: DependencyKind,
}

impl DependencyNode {
    /// A blocking dependency; it runs on the blocking pool.
    pub fn sync<T, F>(name: impl Into<String>, func: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Inputs) -> ApiResult<T> + Send + Sync + 'static,
    {
        Self::with_kind(
            name,
            DependencyKind::Sync(Arc::new(move |inputs: &Inputs| {
                func(inputs).map(|value| Arc::new(value) as Resolved)
            })),
        )
    }

    /// An async dependency; it is awaited on the runtime.
    pub fn asynchronous<T, F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        Self::with_kind(
            name,
            DependencyKind::Async(Arc::new(move |inputs: Inputs| {
                let fut = func(inputs);
                Box::pin(async move { fut.await.map(|value| Arc::new(value) as Resolved) })
                    as BoxFuture<'static, ApiResult<Resolved>>
            })),
        )
    }

    fn with_kind(name: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            depends_on: Vec::new(),
            kind,
        }
    }

    /// Declare a request parameter this dependency reads
    pub fn param(mut self, spec: ParameterSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Require another dependency
    pub fn depends(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParameterSpec] {
        &self.params
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    pub fn is_async(&self) -> bool {
        matches!(self.kind, DependencyKind::Async(_))
    }

    async fn call(&self, inputs: Inputs, pool: &BlockingPool) -> ApiResult<Resolved> {
        match &self.kind {
            DependencyKind::Sync(func) => {
                let func = func.clone();
                pool.run(move || func(&inputs)).await.map_err(pool_error)?
            }
            DependencyKind::Async(func) => match AssertUnwindSafe(func(inputs)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(ApiError::Panic(panic_message(&*payload))),
            },
        }
    }
}

impl fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyNode")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("async", &self.is_async())
            .finish()
    }
}

pub(crate) fn pool_error(err: PoolError) -> ApiError {
    match err {
        PoolError::Panicked(msg) => ApiError::Panic(msg),
        other => ApiError::Internal(other.to_string()),
    }
}

// ============================================================================
// Container and planning
// ============================================================================

/// Registered dependencies
#[derive(Debug, Default)]
pub struct DependencyContainer {
    nodes: HashMap<String, Arc<DependencyNode>>,
}

impl DependencyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node: DependencyNode) -> Result<(), RegistrationError> {
        if self.nodes.contains_key(&node.name) {
            return Err(RegistrationError::DuplicateDependency(node.name));
        }
        self.nodes.insert(node.name.clone(), Arc::new(node));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DependencyNode>> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check the whole graph: every edge resolves and there is no cycle.
    pub fn compile(&self) -> Result<(), RegistrationError> {
        let mut names: Vec<&String> = self.nodes.keys().collect();
        names.sort();
        let roots: Vec<String> = names.into_iter().cloned().collect();
        self.plan(&roots, "<container>").map(|_| ())
    }

    /// Post-order plan for `roots`: leaves first, each node once.
    pub fn plan(&self, roots: &[String], required_by: &str) -> Result<ResolutionPlan, RegistrationError> {
        let mut visiting = Vec::new();
        let mut done = HashSet::new();
        let mut steps = Vec::new();

        for root in roots {
            self.visit(root, required_by, &mut visiting, &mut done, &mut steps)?;
        }

        Ok(ResolutionPlan {
            roots: roots.to_vec(),
            steps,
        })
    }

    fn visit(
        &self,
        name: &str,
        required_by: &str,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
        steps: &mut Vec<Arc<DependencyNode>>,
    ) -> Result<(), RegistrationError> {
        if done.contains(name) {
            return Ok(());
        }
        if let Some(start) = visiting.iter().position(|n| n == name) {
            let mut cycle = visiting[start..].to_vec();
            cycle.push(name.to_string());
            return Err(RegistrationError::DependencyCycle(cycle));
        }

        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| RegistrationError::UnknownDependency {
                name: name.to_string(),
                required_by: required_by.to_string(),
            })?;

        visiting.push(name.to_string());
        for dep in &node.depends_on {
            self.visit(dep, name, visiting, done, steps)?;
        }
        visiting.pop();

        done.insert(name.to_string());
        steps.push(node.clone());
        Ok(())
    }
}

/// Topologically ordered dependencies of one route
#[derive(Debug, Clone, Default)]
pub struct ResolutionPlan {
    roots: Vec<String>,
    steps: Vec<Arc<DependencyNode>>,
}

impl ResolutionPlan {
    /// Dependencies the route asked for directly
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn steps(&self) -> &[Arc<DependencyNode>] {
        &self.steps
    }

    /// Names in resolution order
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|n| n.name()).collect()
    }

    /// Parameters declared by every node in the plan
    pub fn params(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.steps.iter().flat_map(|n| n.params.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve every step for one request.
    ///
    /// The first failure stops the walk; values resolved before it stay cached.
    pub async fn resolve(
        &self,
        ctx: &mut RequestContext,
        params: &Arc<BoundParams>,
        pool: &BlockingPool,
    ) -> ApiResult<()> {
        for node in &self.steps {
            if ctx.cached(&node.name).is_some() {
                debug!(request_id = ctx.id(), dependency = %node.name, "Dependency cache hit");
                continue;
            }
            debug!(request_id = ctx.id(), dependency = %node.name, "Resolving dependency");

            let inputs = Inputs::new(
                ctx.request().clone(),
                params.clone(),
                ctx.resolved_for(&node.depends_on),
                ctx.background().clone(),
            );

            match node.call(inputs, pool).await {
                Ok(value) => ctx.cache(node.name.clone(), value),
                Err(source) => {
                    return Err(ApiError::Dependency {
                        dependency: node.name.clone(),
                        source: Box::new(source),
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use turbo_common::HttpMethod;

    fn unit(name: &str) -> DependencyNode {
        DependencyNode::sync(name, |_: &Inputs| Ok(()))
    }

    fn names(plan: &ResolutionPlan) -> Vec<&str> {
        plan.order()
    }

    #[test]
    fn test_plan_is_post_order_and_deduplicated() {
        let mut container = DependencyContainer::new();
        container.register(unit("db")).unwrap();
        container.register(unit("settings")).unwrap();
        container.register(unit("repo").depends("db").depends("settings")).unwrap();
        container.register(unit("audit").depends("db")).unwrap();

        let plan = container
            .plan(&["repo".to_string(), "audit".to_string()], "GET /x")
            .unwrap();
        assert_eq!(names(&plan), vec!["db", "settings", "repo", "audit"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let mut container = DependencyContainer::new();
        container.register(unit("a").depends("b")).unwrap();
        container.register(unit("b").depends("c")).unwrap();
        container.register(unit("c").depends("a")).unwrap();

        match container.compile() {
            Err(RegistrationError::DependencyCycle(cycle)) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let mut container = DependencyContainer::new();
        container.register(unit("a").depends("ghost")).unwrap();
        assert_eq!(
            container.compile().unwrap_err(),
            RegistrationError::UnknownDependency {
                name: "ghost".into(),
                required_by: "a".into()
            }
        );
        assert_eq!(
            container.register(unit("a")).unwrap_err(),
            RegistrationError::DuplicateDependency("a".into())
        );
    }

    #[tokio::test]
    async fn test_resolve_runs_shared_node_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut container = DependencyContainer::new();
        container
            .register(DependencyNode::sync("db", move |_: &Inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("pool".to_string())
            }))
            .unwrap();
        container
            .register(
                DependencyNode::asynchronous("users", |inputs: Inputs| async move {
                    let db = inputs.dep::<String>("db")?;
                    Ok(format!("users via {}", db))
                })
                .depends("db"),
            )
            .unwrap();
        container
            .register(DependencyNode::sync("orders", |inputs: &Inputs| inputs.dep::<String>("db").map(|db| db.len())).depends("db"))
            .unwrap();

        let plan = container
            .plan(&["users".to_string(), "orders".to_string()], "GET /x")
            .unwrap();
        let mut ctx = RequestContext::new(Request::new(HttpMethod::Get, "/x"));
        plan.resolve(&mut ctx, &Arc::new(BoundParams::new()), &BlockingPool::new(Some(2)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let users = ctx.cached("users").unwrap().clone().downcast::<String>().unwrap();
        assert_eq!(users.as_str(), "users via pool");
    }

    #[tokio::test]
    async fn test_failure_short_circuits() {
        let reached = Arc::new(AtomicUsize::new(0));
        let flag = reached.clone();

        let mut container = DependencyContainer::new();
        container
            .register(DependencyNode::sync("token", |_: &Inputs| -> ApiResult<String> {
                Err(ApiError::http(401, "Not authenticated").with_header("www-authenticate", "Bearer"))
            }))
            .unwrap();
        container
            .register(
                DependencyNode::sync("user", move |_: &Inputs| {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .depends("token"),
            )
            .unwrap();

        let plan = container.plan(&["user".to_string()], "GET /me").unwrap();
        let mut ctx = RequestContext::new(Request::new(HttpMethod::Get, "/me"));
        let err = plan
            .resolve(&mut ctx, &Arc::new(BoundParams::new()), &BlockingPool::new(Some(1)))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 401);
        assert!(matches!(err, ApiError::Dependency { ref dependency, .. } if dependency == "token"));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_panic_becomes_error() {
        let mut container = DependencyContainer::new();
        container
            .register(DependencyNode::asynchronous("boom", |_: Inputs| async {
                let missing: Option<u8> = None;
                Ok(missing.expect("config missing"))
            }))
            .unwrap();
        let plan = container.plan(&["boom".to_string()], "GET /").unwrap();
        let mut ctx = RequestContext::new(Request::new(HttpMethod::Get, "/"));
        let err = plan
            .resolve(&mut ctx, &Arc::new(BoundParams::new()), &BlockingPool::new(Some(1)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
    }
}
