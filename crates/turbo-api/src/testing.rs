//! In-process test client
//!
//! Drives requests through the full dispatch pipeline without sockets. Each
//! call collects the body (streams included) and then runs the request's
//! background tasks to completion, so their effects are visible as soon as
//! the call returns.
//!
//! ```rust
//! use turbo_api::testing::TestClient;
//! use turbo_api::{App, Handler, Inputs, RouteDef};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let app = App::builder()
//!     .route(RouteDef::get("/ping").handler(Handler::sync(|_: &Inputs| Ok("pong"))))
//!     .build()
//!     .unwrap();
//!
//! let client = TestClient::new(app);
//! let res = client.get("/ping").await;
//! assert_eq!(res.status(), 200);
//! assert_eq!(res.text(), "pong");
//! # }
//! ```

use crate::app::App;
use crate::background::TaskOutcome;
use crate::request::Request;
use crate::response::Body;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use turbo_common::HttpMethod;

/// Collected response
#[derive(Debug, Clone)]
pub struct TestResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
    /// Set when the body stream yielded an error
    stream_error: Option<String>,
    tasks: Vec<TaskOutcome>,
}

impl TestResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    /// First value of a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body as JSON; `Value::Null` if it does not parse
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    pub fn stream_error(&self) -> Option<&str> {
        self.stream_error.as_deref()
    }

    /// How each background task of the request ended, in run order
    pub fn task_outcomes(&self) -> &[TaskOutcome] {
        &self.tasks
    }
}

/// Sends requests straight to an [`App`]
#[derive(Debug, Clone)]
pub struct TestClient {
    app: App,
    default_headers: Vec<(String, String)>,
}

impl TestClient {
    pub fn new(app: App) -> Self {
        Self {
            app,
            default_headers: vec![("host".to_string(), "testserver".to_string())],
        }
    }

    /// Header added to every request unless the request sets it
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub async fn get(&self, target: &str) -> TestResponse {
        self.send(Request::new(HttpMethod::Get, target)).await
    }

    pub async fn head(&self, target: &str) -> TestResponse {
        self.send(Request::new(HttpMethod::Head, target)).await
    }

    pub async fn delete(&self, target: &str) -> TestResponse {
        self.send(Request::new(HttpMethod::Delete, target)).await
    }

    pub async fn post_json(&self, target: &str, body: &serde_json::Value) -> TestResponse {
        self.send(Request::new(HttpMethod::Post, target).with_json(body)).await
    }

    pub async fn put_json(&self, target: &str, body: &serde_json::Value) -> TestResponse {
        self.send(Request::new(HttpMethod::Put, target).with_json(body)).await
    }

    /// Start a request to customise before [`send`](Self::send)
    pub fn request(&self, method: HttpMethod, target: &str) -> Request {
        Request::new(method, target)
    }

    /// Dispatch, collect the body, then run background tasks
    pub async fn send(&self, mut request: Request) -> TestResponse {
        for (name, value) in &self.default_headers {
            if request.header(name).is_none() {
                request.insert_header(name, value.clone());
            }
        }

        let dispatched = self.app.dispatch(request).await;
        let (status, headers, body) = dispatched.response.into_parts();

        let mut stream_error = None;
        let body = match body {
            Body::Empty => Bytes::new(),
            Body::Full(bytes) => bytes,
            Body::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => buf.extend_from_slice(&bytes),
                        Err(err) => {
                            stream_error = Some(err.to_string());
                            break;
                        }
                    }
                }
                buf.freeze()
            }
        };

        let tasks = dispatched.tasks.run().await;

        TestResponse {
            status,
            headers,
            body,
            stream_error,
            tasks,
        }
    }
}
