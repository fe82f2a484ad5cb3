//! In-process mock compute server shared by the pipeline tests.
//!
//! Serves the four routes the pipeline talks to. History responses and
//! status codes are scripted per test; every request is recorded so
//! tests can assert on call counts and query parameters.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

pub const JOB_ID: &str = "abc";

#[derive(Clone, Default)]
pub struct MockServer {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    submit_status: Mutex<Option<StatusCode>>,
    submissions: Mutex<Vec<Value>>,
    /// Status codes returned by the next history requests, before any
    /// body is served.
    history_statuses: Mutex<VecDeque<StatusCode>>,
    /// Bodies served in order; the last one repeats.
    history_bodies: Mutex<VecDeque<Value>>,
    history_calls: AtomicUsize,
    /// Status codes per filename; a filename absent here returns bytes.
    view_statuses: Mutex<HashMap<String, VecDeque<StatusCode>>>,
    views: Mutex<Vec<HashMap<String, String>>>,
    ws_frames: Mutex<Vec<String>>,
    ws_connections: AtomicUsize,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_submissions(&self, status: StatusCode) {
        *self.inner.submit_status.lock().unwrap() = Some(status);
    }

    pub fn script_history(&self, bodies: Vec<Value>) {
        *self.inner.history_bodies.lock().unwrap() = bodies.into();
    }

    pub fn script_history_statuses(&self, statuses: Vec<StatusCode>) {
        *self.inner.history_statuses.lock().unwrap() = statuses.into();
    }

    pub fn script_view(&self, filename: &str, statuses: Vec<StatusCode>) {
        self.inner
            .view_statuses
            .lock()
            .unwrap()
            .insert(filename.to_string(), statuses.into());
    }

    pub fn script_ws(&self, frames: Vec<&str>) {
        *self.inner.ws_frames.lock().unwrap() = frames.into_iter().map(String::from).collect();
    }

    pub fn submissions(&self) -> Vec<Value> {
        self.inner.submissions.lock().unwrap().clone()
    }

    pub fn history_calls(&self) -> usize {
        self.inner.history_calls.load(Ordering::SeqCst)
    }

    pub fn views(&self) -> Vec<HashMap<String, String>> {
        self.inner.views.lock().unwrap().clone()
    }

    pub fn ws_connections(&self) -> usize {
        self.inner.ws_connections.load(Ordering::SeqCst)
    }

    /// Start serving on an ephemeral port and return the base URL.
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route("/submit", post(submit))
            .route("/history/{id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws_route))
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }
}

/// A history body reporting the job complete with the given outputs.
pub fn completed(outputs: Value) -> Value {
    entry(json!({ "outputs": outputs }))
}

/// A history body with an arbitrary entry for the job.
pub fn entry(record: Value) -> Value {
    let mut body = serde_json::Map::new();
    body.insert(JOB_ID.to_string(), record);
    Value::Object(body)
}

pub fn artifact_bytes(filename: &str) -> Vec<u8> {
    format!("bytes of {filename}").into_bytes()
}

async fn submit(State(mock): State<MockServer>, Json(body): Json<Value>) -> Response {
    mock.inner.submissions.lock().unwrap().push(body);
    match *mock.inner.submit_status.lock().unwrap() {
        Some(status) => (status, "rejected").into_response(),
        None => Json(json!({ "prompt_id": JOB_ID, "number": 1 })).into_response(),
    }
}

async fn history(State(mock): State<MockServer>, Path(id): Path<String>) -> Response {
    mock.inner.history_calls.fetch_add(1, Ordering::SeqCst);
    assert_eq!(id, JOB_ID);

    if let Some(status) = mock.inner.history_statuses.lock().unwrap().pop_front() {
        return (status, "scripted").into_response();
    }

    let mut bodies = mock.inner.history_bodies.lock().unwrap();
    let body = if bodies.len() > 1 {
        bodies.pop_front().unwrap_or_default()
    } else {
        bodies.front().cloned().unwrap_or_else(|| json!({}))
    };
    Json(body).into_response()
}

async fn view(
    State(mock): State<MockServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    mock.inner.views.lock().unwrap().push(query.clone());
    let filename = query.get("filename").cloned().unwrap_or_default();

    let scripted = mock
        .inner
        .view_statuses
        .lock()
        .unwrap()
        .get_mut(&filename)
        .and_then(VecDeque::pop_front);
    match scripted {
        Some(status) if !status.is_success() => (status, "scripted").into_response(),
        _ => artifact_bytes(&filename).into_response(),
    }
}

async fn ws_route(ws: WebSocketUpgrade, State(mock): State<MockServer>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, mock))
}

async fn serve_socket(mut socket: WebSocket, mock: MockServer) {
    mock.inner.ws_connections.fetch_add(1, Ordering::SeqCst);

    // Subscription handshake.
    let _ = socket.recv().await;

    let frames = mock.inner.ws_frames.lock().unwrap().clone();
    for frame in frames {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if let Message::Close(_) = msg {
            break;
        }
    }
}
