//! HTTP server using Hyper 1.0
//!
//! Thin adapter between hyper and [`App::dispatch`]:
//! - decodes the hyper request into a [`Request`] (body collected up to
//!   `max_body_size`)
//! - encodes the [`Response`] back, streaming bodies chunk by chunk
//! - spawns the request's background tasks once the last body chunk has been
//!   handed to hyper
//! - stops accepting on Ctrl+C / SIGTERM

use crate::app::App;
use crate::background::PendingTasks;
use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};
use crate::request::Request;
use crate::response::{Body, BoxError, Response};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http::header::{CONTENT_LENGTH, COOKIE};
use http::StatusCode;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HyperRequest, Response as HyperResponse};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, field, info, info_span, warn, Instrument};
use turbo_common::HttpMethod;

/// Body type handed to hyper
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// HTTP server wrapping an [`App`]
pub struct Server {
    app: App,
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(app: App, config: ServerConfig) -> Self {
        Self {
            app,
            config: Arc::new(config),
        }
    }

    /// Server with the default configuration
    pub fn with_app(app: App) -> Self {
        Self::new(app, ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    /// Bind the configured address and serve until Ctrl+C or SIGTERM
    ///
    /// ```rust,no_run
    /// use turbo_api::{App, Server, ServerConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let app = App::builder().build()?;
    ///     Server::new(app, ServerConfig::new("127.0.0.1:8000")).run().await
    /// }
    /// ```
    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.bind_addr.parse()?;
        let listener = TcpListener::bind(addr).await?;

        info!("Server listening on http://{}", addr);
        info!("Max body size: {} bytes", self.config.max_body_size);
        info!("Press Ctrl+C to shutdown");

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve connections from `listener` until `shutdown` completes.
    ///
    /// Connections already accepted are left to finish on their own.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "Failed to accept connection");
                            continue;
                        }
                    };
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(error = %err, "Failed to set TCP_NODELAY");
                    }
                    let io = TokioIo::new(stream);
                    let app = self.app.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            handle_request(req, app.clone(), config.clone(), remote_addr)
                        });

                        if let Err(err) = http1::Builder::new()
                            .keep_alive(true)
                            .pipeline_flush(true)
                            .serve_connection(io, service)
                            .await
                        {
                            debug!(error = ?err, "Error serving connection");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping server");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single HTTP request
async fn handle_request(
    hyper_req: HyperRequest<Incoming>,
    app: App,
    config: Arc<ServerConfig>,
    remote_addr: SocketAddr,
) -> Result<HyperResponse<ResponseBody>, Infallible> {
    let span = info_span!(
        "http.request",
        http.method = %hyper_req.method(),
        http.target = %hyper_req.uri(),
        http.status_code = field::Empty,
        request_id = field::Empty,
    );

    async move {
        let started = Instant::now();
        let method = hyper_req.method().clone();
        let path = hyper_req.uri().path().to_string();

        let (response, tasks) = match decode_request(hyper_req, &config, remote_addr).await {
            Ok(request) => {
                let dispatched = app.dispatch(request).await;
                (dispatched.response, dispatched.tasks)
            }
            Err(err) => {
                warn!(error = %err, "Rejected request");
                (err.to_response(app.config().debug), PendingTasks::empty())
            }
        };

        tracing::Span::current().record("http.status_code", response.status());
        if config.enable_logging {
            info!(
                "{} {} {} - from {} in {:.2}ms",
                method,
                path,
                response.status(),
                remote_addr,
                started.elapsed().as_secs_f64() * 1000.0
            );
        }

        Ok(encode_response(response, tasks))
    }
    .instrument(span)
    .await
}

/// Convert a hyper request into a [`Request`]
async fn decode_request(
    hyper_req: HyperRequest<Incoming>,
    config: &ServerConfig,
    remote_addr: SocketAddr,
) -> ApiResult<Request> {
    let (parts, body) = hyper_req.into_parts();

    let method = HttpMethod::from_str(parts.method.as_str()).map_err(|_| ApiError::status(501))?;

    let declared_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if matches!(declared_length, Some(len) if len > config.max_body_size) {
        return Err(ApiError::PayloadTooLarge {
            limit: config.max_body_size,
        });
    }

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = Request::new(method, target).with_remote_addr(remote_addr);

    for (name, value) in parts.headers.iter() {
        let Ok(value) = value.to_str() else {
            debug!(header = %name, "Skipping non-ASCII header value");
            continue;
        };
        // Repeated headers are folded into one comma-separated value;
        // cookie headers accumulate in the cookie map instead.
        let merged = match request.header(name.as_str()) {
            Some(existing) if *name != COOKIE => format!("{}, {}", existing, value),
            _ => value.to_string(),
        };
        request.insert_header(name.as_str(), merged);
    }
    if let Some(proto) = request.header("x-forwarded-proto") {
        let scheme = proto.split(',').next().unwrap_or("http").trim().to_ascii_lowercase();
        request.scheme = scheme;
    }

    request.body = collect_body(body, config.max_body_size).await?;
    Ok(request)
}

/// Collect request body with size limit
async fn collect_body(body: Incoming, limit: usize) -> ApiResult<Bytes> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ApiError::PayloadTooLarge { limit })
        }
        Err(err) => Err(ApiError::BadRequest(format!("Failed to read request body: {}", err))),
    }
}

/// Convert a [`Response`] into a hyper response.
///
/// When background tasks are pending, the body is wrapped so they are
/// spawned right after the last chunk is polled, or from `Drop` if the
/// client goes away first.
fn encode_response(response: Response, tasks: PendingTasks) -> HyperResponse<ResponseBody> {
    let (status, headers, body) = response.into_parts();
    let has_length = headers.iter().any(|(name, _)| name == "content-length");
    let bodiless = matches!(status, 204 | 304) || (100..200).contains(&status);

    let mut builder = HyperResponse::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let body = match body {
        Body::Empty => {
            if !has_length && !bodiless {
                builder = builder.header(CONTENT_LENGTH, 0);
            }
            if tasks.is_empty() {
                Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
            } else {
                with_tasks(futures_util::stream::empty(), tasks)
            }
        }
        Body::Full(bytes) => {
            if !has_length {
                builder = builder.header(CONTENT_LENGTH, bytes.len());
            }
            if tasks.is_empty() {
                Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
            } else {
                with_tasks(futures_util::stream::once(async move { Ok(bytes) }), tasks)
            }
        }
        Body::Stream(stream) => with_tasks(stream, tasks),
    };

    builder.body(body).unwrap_or_else(|err| {
        error!(error = %err, "Failed to build response");
        let mut fallback = HyperResponse::new(
            Full::new(Bytes::from_static(b"Internal Server Error"))
                .map_err(|never| match never {})
                .boxed_unsync(),
        );
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}

fn with_tasks<S>(chunks: S, tasks: PendingTasks) -> ResponseBody
where
    S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
{
    let frames = async_stream::stream! {
        let tasks = tasks;
        futures_util::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => yield Ok(Frame::data(bytes)),
                Err(err) => {
                    error!(error = %err, "Response stream failed");
                    yield Err(err);
                    break;
                }
            }
        }
        // The last chunk is with hyper once the stream is polled again
        let _ = tasks.spawn();
    };
    StreamBody::new(frames).boxed_unsync()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
