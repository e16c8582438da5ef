//! Handlers and route metadata
//!
//! A handler is either blocking or async, decided once when the route is
//! registered. Dispatch is a plain match on the variant: async handlers are
//! awaited on the runtime, sync handlers go to the [`BlockingPool`]. Panics
//! on either path come back as [`ApiError::Panic`].

use crate::dependency::{pool_error, BoxFuture, Inputs};
use crate::error::{ApiError, ApiResult};
use crate::executor::{panic_message, BlockingPool};
use crate::response::Reply;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use turbo_validation::ModelSchema;

type SyncHandlerFn = Arc<dyn Fn(&Inputs) -> ApiResult<Reply> + Send + Sync>;
type AsyncHandlerFn = Arc<dyn Fn(Inputs) -> BoxFuture<'static, ApiResult<Reply>> + Send + Sync>;

/// Route handler
#[derive(Clone)]
pub enum Handler {
    Sync(SyncHandlerFn),
    Async(AsyncHandlerFn),
}

impl Handler {
    /// Blocking handler, run on the blocking pool
    pub fn sync<F, R>(func: F) -> Self
    where
        F: Fn(&Inputs) -> ApiResult<R> + Send + Sync + 'static,
        R: Into<Reply>,
    {
        Handler::Sync(Arc::new(move |inputs: &Inputs| func(inputs).map(Into::into)))
    }

    /// Async handler, awaited on the runtime
    pub fn asynchronous<F, Fut, R>(func: F) -> Self
    where
        F: Fn(Inputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<R>> + Send + 'static,
        R: Into<Reply>,
    {
        Handler::Async(Arc::new(move |inputs: Inputs| {
            let fut = func(inputs);
            Box::pin(async move { fut.await.map(Into::into) }) as BoxFuture<'static, ApiResult<Reply>>
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }

    pub(crate) async fn invoke(&self, inputs: Inputs, pool: &BlockingPool) -> ApiResult<Reply> {
        match self {
            Handler::Sync(func) => {
                let func = func.clone();
                pool.run(move || func(&inputs)).await.map_err(pool_error)?
            }
            Handler::Async(func) => match AssertUnwindSafe(func(inputs)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(ApiError::Panic(panic_message(&*payload))),
            },
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Route metadata
#[derive(Debug, Clone)]
pub struct RouteMeta {
    /// Route name (defaults to `METHOD template`)
    pub name: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Status for successful non-`Response` replies
    pub status_code: u16,
    /// Output shape; replies are validated and serialized through it
    pub response_model: Option<Arc<ModelSchema>>,
    pub deprecated: bool,
}

impl Default for RouteMeta {
    fn default() -> Self {
        Self {
            name: None,
            summary: None,
            description: None,
            tags: Vec::new(),
            status_code: 200,
            response_model: None,
            deprecated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::BackgroundTasks;
    use crate::params::BoundParams;
    use crate::request::Request;
    use std::collections::HashMap;
    use turbo_common::HttpMethod;

    fn inputs() -> Inputs {
        Inputs::new(
            Arc::new(Request::new(HttpMethod::Get, "/")),
            Arc::new(BoundParams::new()),
            HashMap::new(),
            BackgroundTasks::new(),
        )
    }

    #[tokio::test]
    async fn test_sync_and_async_converge() {
        let pool = BlockingPool::new(Some(1));
        let sync = Handler::sync(|_: &Inputs| Ok(serde_json::json!({"kind": "sync"})));
        let async_ = Handler::asynchronous(|_: Inputs| async { Ok(serde_json::json!({"kind": "async"})) });

        assert!(!sync.is_async());
        assert!(async_.is_async());
        for handler in [sync, async_] {
            match handler.invoke(inputs(), &pool).await.unwrap() {
                Reply::Json(v) => assert!(v["kind"].is_string()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_panics_become_errors() {
        let pool = BlockingPool::new(Some(1));
        let sync = Handler::sync(|_: &Inputs| -> ApiResult<Reply> { panic!("sync boom") });
        let err = sync.invoke(inputs(), &pool).await.unwrap_err();
        assert!(matches!(err, ApiError::Panic(ref m) if m == "sync boom"));

        let async_ = Handler::asynchronous(|_: Inputs| async {
            let missing: Option<Reply> = None;
            Ok(missing.expect("async boom"))
        });
        let err = async_.invoke(inputs(), &pool).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_route_meta_defaults() {
        let meta = RouteMeta::default();
        assert_eq!(meta.status_code, 200);
        assert!(meta.response_model.is_none());
    }
}
