//! Application builder and request dispatch
//!
//! Routes, dependencies and middleware are collected on an [`AppBuilder`].
//! `build()` checks everything up front: templates, parameter declarations,
//! the dependency graph and route conflicts. The resulting [`App`] is an
//! immutable snapshot shared behind an `Arc`; dispatch never takes a lock.
//!
//! # Example
//!
//! ```rust
//! use turbo_api::{App, Handler, Inputs, ParameterSpec, RouteDef};
//! use turbo_validation::TypeDescriptor;
//!
//! let app = App::builder()
//!     .route(
//!         RouteDef::get("/items/{item_id}")
//!             .param(ParameterSpec::path("item_id", TypeDescriptor::Int))
//!             .handler(Handler::sync(|inputs: &Inputs| {
//!                 let id = inputs.params().get_i64("item_id");
//!                 Ok(serde_json::json!({ "item_id": id }))
//!             })),
//!     )
//!     .build()
//!     .unwrap();
//! assert_eq!(app.routes().len(), 1);
//! ```

use crate::background::PendingTasks;
use crate::config::AppConfig;
use crate::context::{RequestContext, Stage};
use crate::dependency::{DependencyContainer, DependencyNode, Inputs, ResolutionPlan};
use crate::error::{ApiError, ApiResult, RegistrationError};
use crate::executor::BlockingPool;
use crate::handler::{Handler, RouteMeta};
use crate::middleware::{BeforeOutcome, Middleware, MiddlewareChain};
use crate::params::{ParamSource, ParameterSpec, RequestBinder};
use crate::request::Request;
use crate::response::{Body, Reply, Response};
use crate::router::{PathTemplate, Router};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};
use turbo_common::HttpMethod;
use turbo_validation::{CoercionMode, ModelSchema, SerializerContext};

// ============================================================================
// Route definitions
// ============================================================================

/// A route as declared by the application
#[derive(Debug, Clone)]
pub struct RouteDef {
    method: HttpMethod,
    template: String,
    prefix: Option<String>,
    params: Vec<ParameterSpec>,
    dependencies: Vec<String>,
    handler: Option<Handler>,
    meta: RouteMeta,
    coercion: CoercionMode,
}

impl RouteDef {
    pub fn new(method: HttpMethod, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
            prefix: None,
            params: Vec::new(),
            dependencies: Vec::new(),
            handler: None,
            meta: RouteMeta::default(),
            coercion: CoercionMode::Lax,
        }
    }

    pub fn get(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, template)
    }

    pub fn post(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, template)
    }

    pub fn put(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, template)
    }

    pub fn patch(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Patch, template)
    }

    pub fn delete(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, template)
    }

    pub fn head(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Head, template)
    }

    pub fn options(template: impl Into<String>) -> Self {
        Self::new(HttpMethod::Options, template)
    }

    pub fn param(mut self, spec: ParameterSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Require a registered dependency; its value is available via
    /// [`Inputs::dep`]
    pub fn depends(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = Some(name.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.meta.summary = Some(summary.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.push(tag.into());
        self
    }

    /// Status for successful JSON replies (default 200)
    pub fn status_code(mut self, status: u16) -> Self {
        self.meta.status_code = status;
        self
    }

    /// Validate and serialize replies through `model`
    pub fn response_model(mut self, model: impl Into<Arc<ModelSchema>>) -> Self {
        self.meta.response_model = Some(model.into());
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.meta.deprecated = true;
        self
    }

    /// Reject JSON body values of the wrong type instead of coercing them
    pub fn strict(mut self) -> Self {
        self.coercion = CoercionMode::Strict;
        self
    }

    fn label(&self, template: &PathTemplate) -> String {
        format!("{} {}", self.method, template)
    }
}

/// Routes sharing a path prefix, tags and dependencies
#[derive(Debug, Clone)]
pub struct RouteGroup {
    prefix: String,
    tags: Vec<String>,
    dependencies: Vec<String>,
    routes: Vec<RouteDef>,
}

impl RouteGroup {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tags: Vec::new(),
            dependencies: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Dependency required by every route in the group
    pub fn depends(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn route(mut self, route: RouteDef) -> Self {
        self.routes.push(route);
        self
    }

    fn into_routes(self) -> Vec<RouteDef> {
        let RouteGroup {
            prefix,
            tags,
            dependencies,
            routes,
        } = self;
        routes
            .into_iter()
            .map(|mut route| {
                route.prefix = Some(match route.prefix.take() {
                    Some(inner) => format!("{}{}", prefix.trim_end_matches('/'), inner),
                    None => prefix.clone(),
                });
                let mut deps = dependencies.clone();
                deps.append(&mut route.dependencies);
                route.dependencies = deps;
                route.meta.tags.extend(tags.iter().cloned());
                route
            })
            .collect()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Collects routes, dependencies and middleware
#[derive(Default)]
pub struct AppBuilder {
    routes: Vec<RouteDef>,
    dependencies: Vec<DependencyNode>,
    middleware: MiddlewareChain,
    config: AppConfig,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, route: RouteDef) -> Self {
        self.routes.push(route);
        self
    }

    pub fn dependency(mut self, node: DependencyNode) -> Self {
        self.dependencies.push(node);
        self
    }

    pub fn include(mut self, group: RouteGroup) -> Self {
        self.routes.extend(group.into_routes());
        self
    }

    /// Add middleware. The first added is the outermost.
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.add(middleware);
        self
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate every declaration and freeze the route table
    pub fn build(self) -> Result<App, RegistrationError> {
        let mut container = DependencyContainer::new();
        for node in self.dependencies {
            for spec in node.params() {
                spec.check(node.name())?;
            }
            container.register(node)?;
        }
        container.compile()?;

        let mut router = Router::new();
        for def in self.routes {
            let route = compile_route(def, &container)?;
            let (method, template) = (route.method, route.template.clone());
            router.insert(method, template, route)?;
        }

        debug!(routes = router.len(), dependencies = container.len(), "Application built");

        Ok(App {
            inner: Arc::new(AppInner {
                router,
                middleware: self.middleware,
                pool: BlockingPool::new(self.config.blocking_workers),
                config: self.config,
            }),
        })
    }
}

impl fmt::Debug for AppBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppBuilder")
            .field("routes", &self.routes.len())
            .field("dependencies", &self.dependencies.len())
            .field("middleware", &self.middleware)
            .field("config", &self.config)
            .finish()
    }
}

/// A route ready to serve
struct CompiledRoute {
    method: HttpMethod,
    template: PathTemplate,
    label: String,
    handler: Handler,
    binder: RequestBinder,
    plan: ResolutionPlan,
    meta: RouteMeta,
}

fn compile_route(def: RouteDef, container: &DependencyContainer) -> Result<CompiledRoute, RegistrationError> {
    let mut template = PathTemplate::parse(&def.template)?;
    if let Some(prefix) = &def.prefix {
        template = template.prefixed(&PathTemplate::parse(prefix)?)?;
    }
    let label = def.label(&template);

    let handler = def
        .handler
        .clone()
        .ok_or_else(|| RegistrationError::MissingHandler(label.clone()))?;

    for spec in &def.params {
        spec.check(&label)?;
    }

    let plan = container.plan(&def.dependencies, &label)?;

    for spec in def.params.iter().chain(plan.params()) {
        if spec.source == ParamSource::Path
            && !template.has_param(spec.name())
            && !template.has_param(spec.wire_name())
        {
            return Err(RegistrationError::InvalidParameter {
                route: label,
                name: spec.name().to_string(),
                reason: "path parameter is not in the template".to_string(),
            });
        }
    }

    // Route declarations win over dependency declarations of the same name
    let mut params = def.params;
    for spec in plan.params() {
        if !params.iter().any(|p| p.name() == spec.name()) {
            params.push(spec.clone());
        }
    }

    Ok(CompiledRoute {
        method: def.method,
        template,
        label,
        handler,
        binder: RequestBinder::new(params).with_coercion(def.coercion),
        plan,
        meta: def.meta,
    })
}

// ============================================================================
// App
// ============================================================================

/// A registered route, for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: HttpMethod,
    pub path: String,
    pub name: String,
    pub tags: Vec<String>,
    pub deprecated: bool,
}

/// Outcome of dispatching one request
///
/// The caller sends `response` first, then runs or spawns `tasks`.
#[derive(Debug)]
pub struct Dispatched {
    pub response: Response,
    pub tasks: PendingTasks,
}

struct AppInner {
    router: Router<CompiledRoute>,
    middleware: MiddlewareChain,
    pool: BlockingPool,
    config: AppConfig,
}

/// Built application; cheap to clone
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn blocking_pool(&self) -> &BlockingPool {
        &self.inner.pool
    }

    /// Registered routes in registration order
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.inner
            .router
            .routes()
            .iter()
            .map(|entry| {
                let route = &entry.value;
                RouteInfo {
                    method: route.method,
                    path: route.template.as_str().to_string(),
                    name: route.meta.name.clone().unwrap_or_else(|| route.label.clone()),
                    tags: route.meta.tags.clone(),
                    deprecated: route.meta.deprecated,
                }
            })
            .collect()
    }

    /// Run one request through middleware, routing, binding, dependencies
    /// and the handler. Never fails: errors become error responses.
    pub async fn dispatch(&self, mut request: Request) -> Dispatched {
        let chain = &self.inner.middleware;
        let debug_errors = self.inner.config.debug;

        let outcome = chain.process_request(&mut request).await;
        let mut ctx = RequestContext::new(request).with_pool(self.inner.pool.clone());
        tracing::Span::current().record("request_id", ctx.id());

        let (depth, result) = match outcome {
            BeforeOutcome::Continue => (chain.len(), self.handle(&mut ctx).await),
            BeforeOutcome::Halted { depth, result } => (depth, result),
        };

        let mut response = match result {
            Ok(response) => {
                ctx.advance(Stage::ResponseReady);
                response
            }
            Err(err) => {
                ctx.advance(Stage::Error);
                self.log_error(&ctx, &err);
                err.to_response(debug_errors)
            }
        };

        let request = ctx.request().clone();
        if let Err(err) = chain.process_response(depth, &request, &mut response).await {
            self.log_error(&ctx, &err);
            response = err.to_response(debug_errors);
        }

        if request.method == HttpMethod::Head {
            strip_body(&mut response);
        }

        Dispatched {
            response,
            tasks: ctx.background().drain(self.inner.pool.clone()),
        }
    }

    async fn handle(&self, ctx: &mut RequestContext) -> ApiResult<Response> {
        let request = ctx.request().clone();
        let matched = self.inner.router.lookup(request.method, &request.path)?;
        let route = &matched.entry.value;
        ctx.advance(Stage::Matched);
        debug!(request_id = ctx.id(), route = %route.label, "Route matched");

        if self.inner.config.redirect_slashes && request.path.len() > 1 && request.path.ends_with('/') {
            let canonical = request.path.trim_end_matches('/');
            let location = match &request.raw_query {
                Some(query) => format!("{}?{}", canonical, query),
                None => canonical.to_string(),
            };
            return Ok(Response::redirect(location));
        }

        let params = Arc::new(route.binder.bind(&request, &matched.params)?);
        ctx.advance(Stage::ParamsBound);

        route.plan.resolve(ctx, &params, &self.inner.pool).await?;
        ctx.advance(Stage::DependenciesResolved);

        let inputs = Inputs::new(
            request,
            params,
            ctx.resolved_for(route.plan.roots()),
            ctx.background().clone(),
        );
        ctx.advance(Stage::Invoking);
        let reply = route.handler.invoke(inputs, &self.inner.pool).await?;

        shape_reply(route, reply)
    }

    fn log_error(&self, ctx: &RequestContext, err: &ApiError) {
        let request = ctx.request();
        if err.is_server_error() {
            error!(
                request_id = ctx.id(),
                method = %request.method,
                path = %request.path,
                error = %err,
                "Request failed"
            );
        } else if self.inner.config.log_requests {
            warn!(
                request_id = ctx.id(),
                method = %request.method,
                path = %request.path,
                status = err.status_code(),
                error = %err,
                "Client error"
            );
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.inner.router.len())
            .field("middleware", &self.inner.middleware)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Turn a handler reply into a response, applying the route's response
/// model and status code. Full responses pass through untouched.
fn shape_reply(route: &CompiledRoute, reply: Reply) -> ApiResult<Response> {
    let status = route.meta.status_code;
    let json = match (reply, &route.meta.response_model) {
        (Reply::Response(response), _) => return Ok(response),
        (Reply::Json(json), None) => json,
        (reply, Some(model)) => {
            let value = match reply.into_value() {
                Ok(value) => value,
                Err(response) => return Ok(response),
            };
            model
                .dump(value, &SerializerContext::new())
                .map_err(ApiError::ResponseValidation)?
        }
        (Reply::Value(value), None) => value.to_json(),
    };

    if matches!(status, 204 | 304) {
        return Ok(Response::new(status));
    }
    Ok(Response::json(&json).with_status(status))
}

/// HEAD responses keep their headers, including the length the GET body
/// would have had
fn strip_body(response: &mut Response) {
    if let Some(bytes) = response.body_bytes() {
        if response.header("content-length").is_none() {
            let len = bytes.len().to_string();
            response.set_header("content-length", len);
        }
    }
    response.set_body(Body::Empty);
}

#[cfg(test)]
mod tests {
    use super::*;
    use turbo_validation::TypeDescriptor;

    fn ok_handler() -> Handler {
        Handler::sync(|_: &Inputs| Ok(serde_json::json!({"ok": true})))
    }

    #[test]
    fn test_build_rejects_duplicate_routes() {
        let err = App::builder()
            .route(RouteDef::get("/items/{id}").handler(ok_handler()))
            .route(RouteDef::get("/items/{item_id}").handler(ok_handler()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateRoute { .. }));
    }

    #[test]
    fn test_build_rejects_missing_handler_and_unknown_path_param() {
        let err = App::builder().route(RouteDef::get("/x")).build().unwrap_err();
        assert_eq!(err, RegistrationError::MissingHandler("GET /x".to_string()));

        let err = App::builder()
            .route(
                RouteDef::get("/items")
                    .param(ParameterSpec::path("item_id", TypeDescriptor::Int))
                    .handler(ok_handler()),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidParameter { ref name, .. } if name == "item_id"));
    }

    #[test]
    fn test_build_rejects_dependency_path_param_missing_from_template() {
        let owner = DependencyNode::sync("owner", |_: &Inputs| Ok(()))
            .param(ParameterSpec::path("user_id", TypeDescriptor::Int));

        let err = App::builder()
            .dependency(owner.clone())
            .route(RouteDef::get("/items/{item_id}").depends("owner").handler(ok_handler()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidParameter { ref name, .. } if name == "user_id"));

        let app = App::builder()
            .dependency(owner)
            .route(RouteDef::get("/users/{user_id}/items").depends("owner").handler(ok_handler()))
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_rejects_bad_pattern_and_unknown_dependency() {
        let err = App::builder()
            .route(
                RouteDef::get("/search")
                    .param(ParameterSpec::query("q", TypeDescriptor::String).pattern("(unclosed"))
                    .handler(ok_handler()),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidPattern { .. }));

        let err = App::builder()
            .route(RouteDef::get("/me").depends("current_user").handler(ok_handler()))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnknownDependency {
                name: "current_user".to_string(),
                required_by: "GET /me".to_string(),
            }
        );
    }

    #[test]
    fn test_groups_prefix_tag_and_depend() {
        let app = App::builder()
            .dependency(DependencyNode::sync("auth", |_: &Inputs| Ok(())))
            .include(
                RouteGroup::new("/admin")
                    .tag("admin")
                    .depends("auth")
                    .route(RouteDef::get("/").name("admin_home").handler(ok_handler()))
                    .route(RouteDef::get("/users/{id}").deprecated().handler(ok_handler())),
            )
            .build()
            .unwrap();

        let routes = app.routes();
        assert_eq!(routes[0].path, "/admin");
        assert_eq!(routes[0].name, "admin_home");
        assert_eq!(routes[0].tags, vec!["admin".to_string()]);
        assert_eq!(routes[1].path, "/admin/users/{id}");
        assert_eq!(routes[1].name, "GET /admin/users/{id}");
        assert!(routes[1].deprecated);
    }

    #[tokio::test]
    async fn test_dispatch_walks_every_stage() {
        let app = App::builder()
            .route(
                RouteDef::post("/items")
                    .status_code(201)
                    .param(ParameterSpec::body("name", TypeDescriptor::String).embed())
                    .handler(Handler::asynchronous(|inputs: Inputs| async move {
                        let name = inputs.params().get_str("name").unwrap_or_default().to_string();
                        Ok(serde_json::json!({ "name": name }))
                    })),
            )
            .build()
            .unwrap();

        let request = Request::new(HttpMethod::Post, "/items").with_json(&serde_json::json!({"name": "pen"}));
        let dispatched = app.dispatch(request).await;
        assert_eq!(dispatched.response.status(), 201);
        assert_eq!(dispatched.response.body_bytes(), Some(&br#"{"name":"pen"}"#[..]));
        assert!(dispatched.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_strict_route_rejects_loose_json() {
        let app = App::builder()
            .route(
                RouteDef::post("/counts")
                    .strict()
                    .param(ParameterSpec::body("count", TypeDescriptor::Int).embed())
                    .handler(ok_handler()),
            )
            .route(
                RouteDef::post("/loose")
                    .param(ParameterSpec::body("count", TypeDescriptor::Int).embed())
                    .handler(ok_handler()),
            )
            .build()
            .unwrap();

        let body = serde_json::json!({"count": "3"});
        let dispatched = app.dispatch(Request::new(HttpMethod::Post, "/counts").with_json(&body)).await;
        assert_eq!(dispatched.response.status(), 422);

        let dispatched = app.dispatch(Request::new(HttpMethod::Post, "/loose").with_json(&body)).await;
        assert_eq!(dispatched.response.status(), 200);
    }

    #[tokio::test]
    async fn test_redirect_slashes() {
        let app = App::builder()
            .config(AppConfig::new().redirect_slashes(true))
            .route(RouteDef::get("/items").handler(ok_handler()))
            .build()
            .unwrap();

        let dispatched = app.dispatch(Request::new(HttpMethod::Get, "/items/?page=2")).await;
        assert_eq!(dispatched.response.status(), 307);
        assert_eq!(dispatched.response.header("location"), Some("/items?page=2"));

        let dispatched = app.dispatch(Request::new(HttpMethod::Get, "/items")).await;
        assert_eq!(dispatched.response.status(), 200);
    }
}
