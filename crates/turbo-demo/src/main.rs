//! TurboAPI demo service
//!
//! Usage:
//!   turbo-demo                          Serve on 127.0.0.1:8000
//!   turbo-demo --bind 0.0.0.0:3000      Custom bind address
//!   turbo-demo --workers 8              Size of the sync handler pool
//!   turbo-demo --log-level debug --log-format json
//!
//! Routes:
//!   GET    /health
//!   GET    /items?skip=0&limit=10
//!   GET    /items/{item_id}
//!   POST   /items
//!   DELETE /items/{item_id}
//!   GET    /users/me            (Authorization: Bearer <token>)
//!   GET    /events              (server-sent events)

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use turbo_api::sse::keep_alive_stream;
use turbo_api::{
    init_tracing, sse_response, ApiError, App, AppConfig, CorsMiddleware, DependencyNode, GZipMiddleware,
    Handler, Inputs, LogConfig, LogFormat, ParameterSpec, Response, RouteDef, RouteGroup, Server, ServerConfig,
    SseEvent,
};
use turbo_common::HttpStatus;
use turbo_validation::{Constraint, FieldDescriptor, ModelSchema, TypeDescriptor, Value};

#[derive(Parser)]
#[command(name = "turbo-demo")]
#[command(about = "Example TurboAPI service", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on (overrides TURBO_BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// Blocking pool size for sync handlers (overrides TURBO_BLOCKING_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Include internal error messages in 500 responses
    #[arg(long)]
    debug: bool,
}

/// In-memory item store shared by the handlers
#[derive(Default)]
struct ItemStore {
    items: RwLock<Vec<(i64, serde_json::Value)>>,
}

impl ItemStore {
    fn list(&self, skip: usize, limit: usize) -> Vec<serde_json::Value> {
        self.items
            .read()
            .iter()
            .skip(skip)
            .take(limit)
            .map(|(_, item)| item.clone())
            .collect()
    }

    fn get(&self, id: i64) -> Option<serde_json::Value> {
        self.items
            .read()
            .iter()
            .find(|(item_id, _)| *item_id == id)
            .map(|(_, item)| item.clone())
    }

    fn insert(&self, mut item: serde_json::Value) -> serde_json::Value {
        let mut items = self.items.write();
        let id = items.last().map(|(id, _)| id + 1).unwrap_or(1);
        item["id"] = json!(id);
        items.push((id, item.clone()));
        item
    }

    fn remove(&self, id: i64) -> bool {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|(item_id, _)| *item_id != id);
        items.len() != before
    }
}

fn item_schema() -> Arc<ModelSchema> {
    Arc::new(
        ModelSchema::new("Item")
            .field(FieldDescriptor::new("name", TypeDescriptor::String).constraint(Constraint::MinLength(1)))
            .field(FieldDescriptor::new("price", TypeDescriptor::Float).constraint(Constraint::Gt(0.0)))
            .field(FieldDescriptor::new("tags", TypeDescriptor::list(TypeDescriptor::String)).default_value(Vec::<String>::new()))
            .field(FieldDescriptor::new("description", TypeDescriptor::String).optional()),
    )
}

fn item_out_schema() -> Arc<ModelSchema> {
    Arc::new(
        ModelSchema::new("ItemOut")
            .field(FieldDescriptor::new("id", TypeDescriptor::Int))
            .field(FieldDescriptor::new("name", TypeDescriptor::String))
            .field(FieldDescriptor::new("price", TypeDescriptor::Float))
            .field(FieldDescriptor::new("tags", TypeDescriptor::list(TypeDescriptor::String))),
    )
}

fn auth_dependencies() -> Vec<DependencyNode> {
    let token = DependencyNode::sync("token", |inputs: &Inputs| {
        inputs
            .params()
            .get_str("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::http(HttpStatus::UNAUTHORIZED.code(), "Not authenticated")
                    .with_header("www-authenticate", "Bearer")
            })
    })
    .param(ParameterSpec::header("authorization", TypeDescriptor::String).optional());

    let current_user = DependencyNode::asynchronous("current_user", |inputs: Inputs| async move {
        let token = inputs.dep::<String>("token")?;
        if token.is_empty() {
            return Err(ApiError::http(HttpStatus::UNAUTHORIZED.code(), "Invalid token"));
        }
        Ok(json!({"username": format!("user-{}", &token[..token.len().min(8)])}))
    })
    .depends("token");

    vec![token, current_user]
}

fn item_routes(store: Arc<ItemStore>) -> RouteGroup {
    let list_store = store.clone();
    let get_store = store.clone();
    let create_store = store.clone();
    let delete_store = store;

    RouteGroup::new("/items")
        .tag("items")
        .route(
            RouteDef::get("/")
                .name("list_items")
                .param(ParameterSpec::query("skip", TypeDescriptor::Int).default(0i64).ge(0.0))
                .param(ParameterSpec::query("limit", TypeDescriptor::Int).default(10i64).ge(1.0).le(100.0))
                .handler(Handler::sync(move |inputs: &Inputs| {
                    let skip = inputs.params().get_i64("skip").unwrap_or(0) as usize;
                    let limit = inputs.params().get_i64("limit").unwrap_or(10) as usize;
                    Ok(json!(list_store.list(skip, limit)))
                })),
        )
        .route(
            RouteDef::get("/{item_id}")
                .name("get_item")
                .param(ParameterSpec::path("item_id", TypeDescriptor::Int))
                .response_model(item_out_schema())
                .handler(Handler::sync(move |inputs: &Inputs| {
                    let id = inputs.params().get_i64("item_id").unwrap_or_default();
                    get_store
                        .get(id)
                        .ok_or_else(|| ApiError::http(HttpStatus::NOT_FOUND.code(), "Item not found"))
                })),
        )
        .route(
            RouteDef::post("/")
                .name("create_item")
                .param(ParameterSpec::body("item", TypeDescriptor::Model(item_schema())))
                .status_code(HttpStatus::CREATED.code())
                .response_model(item_out_schema())
                .handler(Handler::asynchronous(move |inputs: Inputs| {
                    let store = create_store.clone();
                    async move {
                        let item = inputs.param("item").map(Value::to_json).unwrap_or_default();
                        let created = store.insert(item);
                        let name = created["name"].as_str().unwrap_or_default().to_string();
                        inputs.background().add_task("announce_item", move || async move {
                            info!(item = %name, "Item created");
                            Ok(())
                        });
                        Ok(created)
                    }
                })),
        )
        .route(
            RouteDef::delete("/{item_id}")
                .name("delete_item")
                .param(ParameterSpec::path("item_id", TypeDescriptor::Int))
                .status_code(HttpStatus::NO_CONTENT.code())
                .handler(Handler::sync(move |inputs: &Inputs| {
                    let id = inputs.params().get_i64("item_id").unwrap_or_default();
                    if delete_store.remove(id) {
                        Ok(Response::no_content())
                    } else {
                        Err(ApiError::http(HttpStatus::NOT_FOUND.code(), "Item not found"))
                    }
                })),
        )
}

fn build_app(config: AppConfig) -> Result<App> {
    let store = Arc::new(ItemStore::default());

    let mut builder = App::builder()
        .config(config)
        .middleware(CorsMiddleware::permissive())
        .middleware(GZipMiddleware::new());
    for node in auth_dependencies() {
        builder = builder.dependency(node);
    }

    let app = builder
        .route(RouteDef::get("/health").handler(Handler::sync(|_: &Inputs| Ok(json!({"status": "ok"})))))
        .include(item_routes(store))
        .route(
            RouteDef::get("/users/me")
                .tag("users")
                .depends("current_user")
                .handler(Handler::sync(|inputs: &Inputs| {
                    let user = inputs.dep::<serde_json::Value>("current_user")?;
                    Ok((*user).clone())
                })),
        )
        .route(RouteDef::get("/events").handler(Handler::asynchronous(|_: Inputs| async {
            Ok(sse_response(ticks()))
        })))
        .build()
        .context("Failed to build application")?;

    Ok(app)
}

/// Numbered ticks, then keep-alive comments until the client leaves
fn ticks() -> impl Stream<Item = SseEvent> + Send + 'static {
    let numbered = (1..=3).map(|n| SseEvent::json(&json!({"tick": n})).with_event("tick"));
    stream::iter(numbered).chain(keep_alive_stream(Duration::from_secs(15)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(LogConfig::new(cli.log_level.clone()).format(cli.log_format));

    let mut app_config = AppConfig::from_env()?.debug(cli.debug);
    if let Some(workers) = cli.workers {
        app_config = app_config.blocking_workers(workers);
    }

    let mut server_config = ServerConfig::from_env()?;
    if let Some(bind) = cli.bind {
        server_config = ServerConfig::new(bind).max_body_size(server_config.max_body_size);
    }

    let app = build_app(app_config)?;
    for route in app.routes() {
        info!(method = %route.method, path = %route.path, name = %route.name, "Registered route");
    }

    Server::new(app, server_config).run().await
}
