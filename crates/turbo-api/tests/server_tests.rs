//! Tests against a real listener over raw HTTP/1.1

use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use turbo_api::{App, Handler, Inputs, ParameterSpec, RouteDef, Server, ServerConfig};
use turbo_validation::TypeDescriptor;

struct Running {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start(app: App, config: ServerConfig) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let shutdown = async {
            let _ = stopped.await;
        };
        Server::new(app, config).serve(listener, shutdown).await.unwrap();
    });

    Running { addr, stop: Some(stop) }
}

async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

fn body_of(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

fn items_app() -> App {
    App::builder()
        .route(
            RouteDef::get("/items/{item_id}")
                .param(ParameterSpec::path("item_id", TypeDescriptor::Int))
                .handler(Handler::sync(|inputs: &Inputs| {
                    Ok(json!({"item_id": inputs.params().get_i64("item_id")}))
                })),
        )
        .route(
            RouteDef::post("/items")
                .param(ParameterSpec::body("name", TypeDescriptor::String).embed())
                .status_code(201)
                .handler(Handler::asynchronous(|inputs: Inputs| async move {
                    Ok(json!({"name": inputs.params().get_str("name")}))
                })),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_get_over_the_wire() {
    let server = start(items_app(), ServerConfig::new("127.0.0.1:0")).await;

    let response = roundtrip(
        server.addr,
        "GET /items/42 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.to_ascii_lowercase().contains("content-type: application/json"));
    assert_eq!(body_of(&response), r#"{"item_id":42}"#);
}

#[tokio::test]
async fn test_post_json_and_validation_error() {
    let server = start(items_app(), ServerConfig::new("127.0.0.1:0")).await;

    let body = r#"{"name":"pen"}"#;
    let request = format!(
        "POST /items HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = roundtrip(server.addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{}", response);
    assert_eq!(body_of(&response), r#"{"name":"pen"}"#);

    let response = roundtrip(
        server.addr,
        "GET /items/abc HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 422 "), "{}", response);
    let detail: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(detail["detail"][0]["loc"], json!(["path", "item_id"]));
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let config = ServerConfig::new("127.0.0.1:0").max_body_size(16);
    let server = start(items_app(), config).await;

    let body = format!(r#"{{"name":"{}"}}"#, "x".repeat(64));
    let request = format!(
        "POST /items HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = roundtrip(server.addr, &request).await;
    assert!(response.starts_with("HTTP/1.1 413 "), "{}", response);
}

#[tokio::test]
async fn test_unknown_method_is_not_implemented() {
    let server = start(items_app(), ServerConfig::new("127.0.0.1:0")).await;

    let response = roundtrip(
        server.addr,
        "BREW /items/1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 501 "), "{}", response);
}

#[tokio::test]
async fn test_background_task_runs_after_response() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let app = App::builder()
        .route(RouteDef::post("/notify").handler(Handler::sync(move |inputs: &Inputs| {
            let flag = flag.clone();
            inputs.background().add_task("notify", move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(json!({"queued": true}))
        })))
        .build()
        .unwrap();
    let server = start(app, ServerConfig::new("127.0.0.1:0")).await;

    let response = roundtrip(
        server.addr,
        "POST /notify HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);

    for _ in 0..50 {
        if ran.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ran.load(Ordering::SeqCst));
}
