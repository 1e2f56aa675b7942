//! Shared test utilities for telemetry forwarder integration tests.
//!
//! [`MockHost`] serves the Extensions and Telemetry APIs from a local port and
//! records every call it receives. [`RecordingWriter`] captures what the
//! listener forwards.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use lambda_telemetry_forwarder::{EnrichedRecord, Writer, WriterError};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Identifier the mock host hands out on registration.
pub const EXTENSION_ID: &str = "7a5e0c2b-test-extension-id";

/// A call received by the mock host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    Register,
    Subscribe,
    NextEvent,
}

struct HostState {
    register_status: StatusCode,
    subscribe_status: StatusCode,
    send_identifier: bool,
    register_body: Option<&'static str>,
    events: Mutex<VecDeque<(StatusCode, Value)>>,
    push_on_subscribe: Option<Value>,
    pending_push: Mutex<Option<JoinHandle<()>>>,
    calls: Mutex<Vec<HostCall>>,
    extension_names: Mutex<Vec<String>>,
    register_bodies: Mutex<Vec<Value>>,
    subscriptions: Mutex<Vec<Value>>,
    identifiers: Mutex<Vec<String>>,
}

/// Builder for [`MockHost`].
pub struct MockHostBuilder {
    register_status: StatusCode,
    subscribe_status: StatusCode,
    send_identifier: bool,
    register_body: Option<&'static str>,
    events: VecDeque<(StatusCode, Value)>,
    push_on_subscribe: Option<Value>,
}

impl MockHostBuilder {
    pub fn register_status(mut self, status: StatusCode) -> Self {
        self.register_status = status;
        self
    }

    pub fn without_identifier(mut self) -> Self {
        self.send_identifier = false;
        self
    }

    /// Replaces the JSON register response with a raw body.
    pub fn register_body(mut self, body: &'static str) -> Self {
        self.register_body = Some(body);
        self
    }

    pub fn subscribe_status(mut self, status: StatusCode) -> Self {
        self.subscribe_status = status;
        self
    }

    /// Queues a successful `/event/next` response.
    pub fn event(self, event: Value) -> Self {
        self.event_with_status(StatusCode::OK, event)
    }

    /// Queues an `/event/next` response. Once the queue is empty the host
    /// never answers.
    pub fn event_with_status(mut self, status: StatusCode, event: Value) -> Self {
        self.events.push_back((status, event));
        self
    }

    /// POSTs `batch` to the subscribed destination after a successful
    /// subscription. The first `/event/next` answer waits for the push.
    pub fn push_on_subscribe(mut self, batch: Value) -> Self {
        self.push_on_subscribe = Some(batch);
        self
    }

    pub async fn start(self) -> MockHost {
        let state = Arc::new(HostState {
            register_status: self.register_status,
            subscribe_status: self.subscribe_status,
            send_identifier: self.send_identifier,
            register_body: self.register_body,
            events: Mutex::new(self.events),
            push_on_subscribe: self.push_on_subscribe,
            pending_push: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            extension_names: Mutex::new(Vec::new()),
            register_bodies: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            identifiers: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2022-07-01/telemetry", put(subscribe))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock host");
        let addr = listener.local_addr().expect("Mock host has no address");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        MockHost { addr, state, task }
    }
}

/// Local stand-in for the Lambda host APIs.
pub struct MockHost {
    addr: SocketAddr,
    state: Arc<HostState>,
    task: JoinHandle<()>,
}

impl MockHost {
    pub fn builder() -> MockHostBuilder {
        MockHostBuilder {
            register_status: StatusCode::OK,
            subscribe_status: StatusCode::OK,
            send_identifier: true,
            register_body: None,
            events: VecDeque::new(),
            push_on_subscribe: None,
        }
    }

    /// `host:port` as found in `AWS_LAMBDA_RUNTIME_API`.
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: HostCall) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.state.extension_names.lock().unwrap().clone()
    }

    pub fn register_bodies(&self) -> Vec<Value> {
        self.state.register_bodies.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<Value> {
        self.state.subscriptions.lock().unwrap().clone()
    }

    /// Identifier headers seen on subscribe and next-event calls.
    pub fn identifiers(&self) -> Vec<String> {
        self.state.identifiers.lock().unwrap().clone()
    }
}

impl Drop for MockHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn record_identifier(state: &HostState, headers: &HeaderMap) {
    let id = headers
        .get("Lambda-Extension-Identifier")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.identifiers.lock().unwrap().push(id);
}

async fn register(
    State(state): State<Arc<HostState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.lock().unwrap().push(HostCall::Register);
    if let Some(name) = headers
        .get("Lambda-Extension-Name")
        .and_then(|v| v.to_str().ok())
    {
        state.extension_names.lock().unwrap().push(name.to_string());
    }
    if let Ok(body) = serde_json::from_slice(&body) {
        state.register_bodies.lock().unwrap().push(body);
    }

    if state.register_status != StatusCode::OK {
        return (state.register_status, "registration rejected").into_response();
    }

    let mut response_headers = HeaderMap::new();
    if state.send_identifier {
        response_headers.insert(
            "Lambda-Extension-Identifier",
            HeaderValue::from_static(EXTENSION_ID),
        );
    }

    if let Some(body) = state.register_body {
        return (StatusCode::OK, response_headers, body).into_response();
    }

    (
        StatusCode::OK,
        response_headers,
        Json(json!({
            "functionName": "test-function",
            "functionVersion": "$LATEST",
            "handler": "index.handler"
        })),
    )
        .into_response()
}

async fn subscribe(
    State(state): State<Arc<HostState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.calls.lock().unwrap().push(HostCall::Subscribe);
    record_identifier(&state, &headers);

    let subscription: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.subscriptions.lock().unwrap().push(subscription.clone());

    if state.subscribe_status != StatusCode::OK {
        return (state.subscribe_status, "subscription rejected").into_response();
    }

    if let (Some(batch), Some(uri)) = (
        state.push_on_subscribe.clone(),
        subscription["destination"]["URI"].as_str(),
    ) {
        let uri = uri.to_string();
        let push = tokio::spawn(async move {
            let response = reqwest::Client::new()
                .post(&uri)
                .json(&batch)
                .send()
                .await
                .expect("Failed to push telemetry batch");
            assert_eq!(response.status(), reqwest::StatusCode::OK);
        });
        *state.pending_push.lock().unwrap() = Some(push);
    }

    (StatusCode::OK, "OK").into_response()
}

async fn next_event(State(state): State<Arc<HostState>>, headers: HeaderMap) -> Response {
    state.calls.lock().unwrap().push(HostCall::NextEvent);
    record_identifier(&state, &headers);

    let push = state.pending_push.lock().unwrap().take();
    if let Some(push) = push {
        push.await.expect("Telemetry push failed");
    }

    let next = state.events.lock().unwrap().pop_front();
    match next {
        Some((status, event)) => (status, Json(event)).into_response(),
        None => std::future::pending().await,
    }
}

pub fn invoke_event(request_id: &str) -> Value {
    json!({
        "eventType": "INVOKE",
        "deadlineMs": 676051,
        "requestId": request_id,
        "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:test-function",
        "tracing": {
            "type": "X-Amzn-Trace-Id",
            "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2"
        }
    })
}

pub fn shutdown_event(reason: &str) -> Value {
    json!({
        "eventType": "SHUTDOWN",
        "shutdownReason": reason,
        "deadlineMs": 42069
    })
}

/// Writer that keeps every record it is given.
#[derive(Default)]
pub struct RecordingWriter {
    name: String,
    fail: bool,
    records: Mutex<Vec<Value>>,
    flushes: AtomicUsize,
}

impl RecordingWriter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }

    /// A writer that records the attempt and then fails.
    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            ..Self::default()
        })
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Writer for RecordingWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &EnrichedRecord) -> Result<(), WriterError> {
        self.records.lock().unwrap().push(record.to_value());
        if self.fail {
            return Err(WriterError::Send(std::io::ErrorKind::ConnectionReset.into()));
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), WriterError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(format!("condition not met within {:?}", timeout))
}
