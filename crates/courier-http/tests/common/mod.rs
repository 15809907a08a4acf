//! Common test utilities.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use courier_core::provider::bridge::BridgeProvider;
use courier_core::provider::loopback::{LoopbackProvider, LoopbackSession};
use courier_core::{CourierConfig, CourierContext};
use courier_http::{HttpConfig, HttpState};
use tower::ServiceExt;

pub const PEER: &str = "5491122334455";
pub const PEER_CHAT: &str = "5491122334455@c.us";

pub struct TestApp {
    pub state: Arc<HttpState>,
    pub provider: Arc<LoopbackProvider>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        courier_http::router(Arc::clone(&self.state))
    }

    pub fn session(&self) -> Arc<LoopbackSession> {
        self.provider.latest().expect("no session created yet")
    }

    /// Send one request and decode the JSON envelope.
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        call(self.router(), request).await
    }
}

/// App whose sessions live in a [`FakeSidecar`] reached over HTTP.
pub struct BridgeApp {
    pub state: Arc<HttpState>,
    pub sidecar: FakeSidecar,
}

impl BridgeApp {
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        call(courier_http::router(Arc::clone(&self.state)), request).await
    }

    pub async fn wait_ready(&self) -> u64 {
        self.state
            .context
            .sessions
            .wait_until_ready(Duration::from_secs(5))
            .await
            .expect("bridge session never became ready")
            .generation
    }
}

async fn call(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// App over a fresh loopback provider; no session is started.
pub fn build_app(http: HttpConfig) -> TestApp {
    let provider = Arc::new(LoopbackProvider::new());
    let context = CourierContext::builder()
        .config(CourierConfig::default())
        .provider(provider.clone())
        .build()
        .expect("valid test config");
    let state = Arc::new(HttpState::new(context, &http));
    TestApp { state, provider }
}

/// App whose first session is up and ready.
pub async fn ready_app(http: HttpConfig) -> TestApp {
    let app = build_app(http);
    app.state.context.start().await;
    app.state
        .context
        .sessions
        .wait_until_ready(Duration::from_secs(5))
        .await
        .expect("session never became ready");
    app
}

/// Bridge-backed app with its first sidecar session created and initialized.
///
/// The session stays not-ready until a `ready` event arrives on the webhook.
pub async fn bridge_app(config: CourierConfig) -> BridgeApp {
    let sidecar = FakeSidecar::spawn();
    let bridge = Arc::new(BridgeProvider::with_timeout(
        sidecar.base_url.clone(),
        Duration::from_secs(5),
    ));
    let context = CourierContext::builder()
        .config(config)
        .provider(bridge.clone())
        .build()
        .expect("valid test config");
    let state = HttpState::new(context, &HttpConfig::default()).with_bridge(bridge);
    state.context.start().await;
    BridgeApp {
        state: Arc::new(state),
        sidecar,
    }
}

// ============================================================================
// Fake sidecar
// ============================================================================

/// Minimal stand-in for the session sidecar's JSON API.
///
/// Sessions are numbered `s1`, `s2`, ... and sent messages `M1`, `M2`, ...
/// Every request line is recorded. The server thread lives until the test
/// process exits.
pub struct FakeSidecar {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeSidecar {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            let mut sessions = 0;
            let mut messages = 0;
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let mut reader = BufReader::new(stream);
                let Some(line) = read_request(&mut reader) else {
                    continue;
                };
                let body = if line.starts_with("POST /sessions ") {
                    sessions += 1;
                    format!(r#"{{"id":"s{sessions}"}}"#)
                } else if line.starts_with("POST ") && line.contains("/messages ") {
                    messages += 1;
                    format!(
                        r#"{{"messageId":"M{messages}","ack":1,"timestamp":1700000000,"sender":"primary@c.us","receiver":"{PEER_CHAT}"}}"#
                    )
                } else if line.starts_with("GET ") {
                    "[]".to_string()
                } else {
                    "{}".to_string()
                };
                seen.lock().unwrap().push(line);

                let mut stream = reader.into_inner();
                let _ = write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
            }
        });

        Self { base_url, requests }
    }

    /// Request lines received so far, e.g. `POST /sessions/s1/initialize`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Read one request, returning `METHOD PATH` without the HTTP version.
fn read_request(reader: &mut BufReader<std::net::TcpStream>) -> Option<String> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        if header.trim().is_empty() {
            break;
        }
        let lower = header.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().ok()?;
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).ok()?;
    let line = request_line.trim();
    Some(line.rsplit_once(' ').map_or(line, |(head, _)| head).to_string())
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

/// Let spawned tasks (event pumps, correlator updates) run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
