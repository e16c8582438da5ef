//! turbo-api: request routing, validation, dependency injection and dispatch
//!
//! The core of a FastAPI-style framework:
//! - a segment-trie router with typed converters, 404/405 and HEAD fallback
//! - a parameter binder that coerces path, query, header, cookie and body
//!   inputs and reports every failure in one 422
//! - a dependency DAG checked at build time and resolved once per request
//! - sync handlers on a bounded blocking pool, async handlers on the runtime
//! - FIFO background tasks that run after the response is sent
//!
//! Applications are described with [`AppBuilder`] and served either through
//! [`Server`] (hyper) or in-process via [`testing::TestClient`].

pub mod app;
pub mod background;
pub mod config;
pub mod context;
pub mod cookies;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod handler;
pub mod logging;
pub mod middleware;
pub mod params;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod sse;
pub mod testing;

// Re-exports
pub use app::{App, AppBuilder, Dispatched, RouteDef, RouteGroup, RouteInfo};
pub use background::{BackgroundTasks, PendingTasks, TaskOutcome};
pub use config::{AppConfig, ConfigError, ServerConfig};
pub use context::{RequestContext, Stage};
pub use cookies::{Cookie, SameSite};
pub use dependency::{DependencyContainer, DependencyNode, Inputs, ResolutionPlan};
pub use error::{ApiError, ApiResult, RegistrationError};
pub use executor::{BlockingPool, PoolError};
pub use handler::{Handler, RouteMeta};
pub use logging::{init_tracing, LogConfig, LogFormat};
pub use middleware::{
    BasicAuthMiddleware, CorsConfig, CorsMiddleware, GZipMiddleware, HttpsRedirectMiddleware,
    JwtAuthMiddleware, JwtClaims, Middleware, MiddlewareChain, RateLimitMiddleware, TrustedHostMiddleware,
};
pub use params::{BoundParams, ParamSource, ParameterSpec, RequestBinder};
pub use request::Request;
pub use response::{Body, Reply, Response};
pub use router::{Converter, PathTemplate, Router};
pub use server::Server;
pub use sse::{sse_response, SseEvent};

// Re-export shared HTTP types from turbo-common
pub use turbo_common::{HttpMethod, HttpStatus};
