use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE},
    Client, StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    payload::{lenient, lenient_text},
    routes::HttpMethod,
    telemetry::FleetTelemetry,
};

const API_PREFIX: &str = "/api";
const ERROR_BODY_PREVIEW: usize = 100;
const JSON_UTF8: &str = "application/json; charset=utf-8";

/// Outbound call description, independent of the HTTP library.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteRequest {
    /// Endpoint path; the `/api` prefix is optional.
    pub endpoint: String,
    /// Verb as written by the caller. Validated at send time.
    pub method: String,
    /// Query parameters, excluding the api key.
    pub query: Vec<(String, String)>,
    /// Optional JSON body.
    pub body: Option<Value>,
}

impl RemoteRequest {
    /// Creates a request without parameters or body.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the first value of a query parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Where a non-success result came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureClass {
    /// The remote answered (or the request was rejected locally before sending).
    #[default]
    Remote,
    /// Timeout or connection failure.
    Transport,
    /// The remote answered 200 with a body that could not be decoded.
    Decode,
}

/// Uniform result of every remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    /// Status reported by the remote envelope, or synthesized for local failures.
    pub status: u16,
    /// Payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Panel timestamp in milliseconds, when the envelope carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(skip)]
    failure: FailureClass,
}

impl NormalizedResult {
    /// Successful result carrying `data`.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            status: 200,
            data: Some(data),
            error: None,
            time: None,
            failure: FailureClass::Remote,
        }
    }

    /// Failure reported by the remote side.
    #[must_use]
    pub fn remote_error(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            error: Some(error.into()),
            time: None,
            failure: FailureClass::Remote,
        }
    }

    /// Timeout or connection failure.
    #[must_use]
    pub fn transport_error(status: u16, error: impl Into<String>) -> Self {
        Self {
            failure: FailureClass::Transport,
            ..Self::remote_error(status, error)
        }
    }

    /// Undecodable success body.
    #[must_use]
    pub fn decode_error(cause: impl fmt::Display) -> Self {
        Self {
            failure: FailureClass::Decode,
            ..Self::remote_error(500, format!("decode failure: {cause}"))
        }
    }

    /// True when the remote reported status 200.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Failure class; only meaningful when [`Self::is_success`] is false.
    #[must_use]
    pub const fn failure(&self) -> FailureClass {
        self.failure
    }

    /// Best human-readable error text: a non-empty `data`, else `error`, else a placeholder.
    #[must_use]
    pub fn error_message(&self) -> String {
        if let Some(text) = self.data.as_ref().and_then(meaningful_text) {
            return text;
        }
        self.error
            .as_deref()
            .filter(|e| !e.is_empty())
            .map_or_else(|| "unknown error".into(), str::to_string)
    }

    /// Converts into the error taxonomy, yielding the payload on success.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.is_success() {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self.error_message();
        Err(match self.failure {
            FailureClass::Transport => RemoteError::Transport {
                status: self.status,
                message,
            },
            FailureClass::Decode => RemoteError::Decode { message },
            FailureClass::Remote => RemoteError::Api {
                status: self.status,
                message,
            },
        })
    }
}

/// Remote failures surfaced to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// Timeout or connection failure; the caller may retry.
    #[error("transport failure [{status}]: {message}")]
    Transport {
        /// Synthesized status (504 for timeouts, 500 otherwise).
        status: u16,
        /// Cause.
        message: String,
    },
    /// Non-200 status or error envelope from the remote.
    #[error("remote error [{status}]: {message}")]
    Api {
        /// Reported status.
        status: u16,
        /// Reported message.
        message: String,
    },
    /// Malformed success body.
    #[error("{message}")]
    Decode {
        /// Cause, prefixed with `decode failure:`.
        message: String,
    },
}

impl RemoteError {
    /// Status code associated with the failure.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Transport { status, .. } | Self::Api { status, .. } => *status,
            Self::Decode { .. } => 500,
        }
    }
}

/// Anything able to carry a [`RemoteRequest`] to the management API.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Sends the request. Never fails: every outcome is encoded in the result.
    async fn call(&self, request: RemoteRequest) -> NormalizedResult;
}

/// Envelope shape used by the management API. Fields are decoded one by one
/// so an odd side field never discards a valid `data`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, deserialize_with = "lenient")]
    status: Option<u16>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default, deserialize_with = "lenient_text")]
    error: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    time: Option<i64>,
    #[serde(skip)]
    recognized: bool,
}

impl Envelope {
    const KEYS: [&'static str; 3] = ["status", "data", "error"];

    fn decode(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)?;
        let Some(object) = value.as_object() else {
            anyhow::bail!("expected a JSON object");
        };
        let recognized = Self::KEYS.iter().any(|key| object.contains_key(*key));
        let mut envelope: Self = serde_json::from_value(value)?;
        envelope.recognized = recognized;
        Ok(envelope)
    }

    fn into_result(self, http_status: u16) -> NormalizedResult {
        NormalizedResult {
            status: self.status.unwrap_or(http_status),
            data: self.data,
            error: self.error,
            time: self.time,
            failure: FailureClass::Remote,
        }
    }
}

/// Authenticated HTTP client for the management API.
#[derive(Clone)]
pub struct RemoteClient {
    client: Client,
    base_url: String,
    api_key: String,
    telemetry: Option<FleetTelemetry>,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    /// Builder entry point.
    #[must_use]
    pub fn builder(base_url: impl Into<String>, api_key: impl Into<String>) -> RemoteClientBuilder {
        RemoteClientBuilder::new(base_url, api_key)
    }

    /// Full URL for an endpoint, with the `/api` prefix present exactly once.
    #[must_use]
    pub fn url_for(&self, endpoint: &str) -> String {
        join_url(&self.base_url, endpoint)
    }

    async fn send(&self, method: HttpMethod, request: RemoteRequest) -> NormalizedResult {
        let url = self.url_for(&request.endpoint);
        let mut query = Vec::with_capacity(request.query.len() + 1);
        query.push(("apikey".to_string(), self.api_key.clone()));
        query.extend(request.query);

        let mut builder = self
            .client
            .request(method.into(), &url)
            .header(CONTENT_TYPE, HeaderValue::from_static(JSON_UTF8))
            .query(&query);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return self.transport_failure(&url, &err),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => return self.transport_failure(&url, &err),
        };
        normalize_response(status, &body)
    }

    fn transport_failure(&self, url: &str, err: &reqwest::Error) -> NormalizedResult {
        if err.is_timeout() {
            let message = if err.is_connect() {
                "connect timeout"
            } else {
                "read timeout"
            };
            tracing::warn!(%url, "remote call timed out: {message}");
            return NormalizedResult::transport_error(504, message);
        }
        let cause = error_chain(err);
        tracing::error!(%url, error = %cause, "remote call failed");
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Error,
                "fleet.remote.transport_error",
                json!({ "url": redact_url(url), "error": cause }),
            );
        }
        NormalizedResult::transport_error(500, cause)
    }
}

#[async_trait]
impl RemoteTransport for RemoteClient {
    async fn call(&self, request: RemoteRequest) -> NormalizedResult {
        match request.method.parse::<HttpMethod>() {
            Ok(method) => self.send(method, request).await,
            Err(_) => NormalizedResult::remote_error(400, "unsupported method"),
        }
    }
}

/// Builder for [`RemoteClient`].
pub struct RemoteClientBuilder {
    base_url: String,
    api_key: String,
    timeout: Duration,
    connect_timeout: Duration,
    telemetry: Option<FleetTelemetry>,
}

impl RemoteClientBuilder {
    fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            telemetry: None,
        }
    }

    /// Overall bound on every call.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound on establishing the connection.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets telemetry optionally.
    #[must_use]
    pub fn telemetry_opt(mut self, telemetry: Option<FleetTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<RemoteClient> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Requested-With",
            HeaderValue::from_static("XMLHttpRequest"),
        );
        let client = Client::builder()
            .user_agent("fleet-core/0.1")
            .default_headers(headers)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout.min(self.timeout))
            .build()
            .context("building http client")?;
        Ok(RemoteClient {
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key,
            telemetry: self.telemetry,
        })
    }
}

fn normalize_response(status: StatusCode, body: &str) -> NormalizedResult {
    let code = status.as_u16();
    if status != StatusCode::OK {
        return Envelope::decode(body)
            .ok()
            .filter(|envelope| envelope.recognized)
            .map_or_else(
                || {
                    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
                    NormalizedResult::remote_error(code, format!("{code}: {preview}"))
                },
                |envelope| envelope.into_result(code),
            );
    }
    match Envelope::decode(body) {
        Ok(envelope) => envelope.into_result(code),
        Err(err) => NormalizedResult::decode_error(err),
    }
}

fn join_url(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let path = if endpoint.starts_with('/') {
        endpoint.to_string()
    } else {
        format!("/{endpoint}")
    };
    if path == API_PREFIX || path.starts_with("/api/") {
        format!("{base}{path}")
    } else {
        format!("{base}{API_PREFIX}{path}")
    }
}

/// Text of a value that carries information; empty and zero-like values do not.
fn meaningful_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Array(items) if items.is_empty() => None,
        Value::Object(fields) if fields.is_empty() => None,
        Value::Number(n) if n.as_f64().is_some_and(|v| v.abs() < f64::EPSILON) => None,
        other => Some(other.to_string()),
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// In-memory transport answering from a script. Used by tests and offline demos.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Vec<ScriptRule>,
    calls: Vec<RemoteRequest>,
}

#[derive(Debug)]
struct ScriptRule {
    endpoint: String,
    params: Vec<(String, String)>,
    result: NormalizedResult,
}

impl ScriptedTransport {
    /// Creates an empty script; unmatched calls answer 404.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers calls to `endpoint` with `result`.
    #[must_use]
    pub fn respond(self, endpoint: impl Into<String>, result: NormalizedResult) -> Self {
        self.respond_when(endpoint, &[], result)
    }

    /// Answers calls to `endpoint` whose query contains every `params` pair.
    #[must_use]
    pub fn respond_when(
        self,
        endpoint: impl Into<String>,
        params: &[(&str, &str)],
        result: NormalizedResult,
    ) -> Self {
        self.inner.lock().rules.push(ScriptRule {
            endpoint: endpoint.into(),
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            result,
        });
        self
    }

    /// Every request received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.inner.lock().calls.clone()
    }

    /// Requests received for one endpoint.
    #[must_use]
    pub fn calls_to(&self, endpoint: &str) -> Vec<RemoteRequest> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.endpoint == endpoint)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn call(&self, request: RemoteRequest) -> NormalizedResult {
        let mut state = self.inner.lock();
        state.calls.push(request.clone());
        if request.method.parse::<HttpMethod>().is_err() {
            return NormalizedResult::remote_error(400, "unsupported method");
        }
        state
            .rules
            .iter()
            .find(|rule| {
                rule.endpoint == request.endpoint
                    && rule
                        .params
                        .iter()
                        .all(|(k, v)| request.param(k) == Some(v.as_str()))
            })
            .map_or_else(
                || NormalizedResult::remote_error(404, format!("no route for {}", request.endpoint)),
                |rule| rule.result.clone(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    struct Reply {
        status: u16,
        body: String,
        delay: Duration,
    }

    impl Reply {
        fn new(status: u16, body: impl Into<String>) -> Self {
            Self {
                status,
                body: body.into(),
                delay: Duration::ZERO,
            }
        }

        fn json(status: u16, body: &Value) -> Self {
            Self::new(status, body.to_string())
        }
    }

    /// Reads the request head plus a `Content-Length` body.
    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        let mut expected = None;
        loop {
            if expected.is_none() {
                if let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
                    let length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    expected = Some(end + 4 + length);
                }
            }
            if expected.is_some_and(|total| raw.len() >= total) {
                break;
            }
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => raw.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&raw).to_string()
    }

    /// Loopback panel answering one scripted reply per connection.
    struct StubPanel {
        base_url: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl StubPanel {
        fn start(replies: Vec<Reply>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let log = requests.clone();
            thread::spawn(move || {
                for reply in replies {
                    let Ok((mut stream, _)) = listener.accept() else {
                        return;
                    };
                    let raw = read_request(&mut stream);
                    log.lock().unwrap().push(raw);
                    thread::sleep(reply.delay);
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        reply.status,
                        reply.body.len(),
                        reply.body
                    );
                    let _ = stream.write_all(response.as_bytes());
                }
            });
            Self {
                base_url: format!("http://127.0.0.1:{port}"),
                requests,
            }
        }

        fn client(&self) -> RemoteClient {
            RemoteClient::builder(format!("{}/", self.base_url), "secret")
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap()
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[test]
    fn joins_api_prefix_exactly_once() {
        assert_eq!(join_url("http://panel/", "/overview"), "http://panel/api/overview");
        assert_eq!(join_url("http://panel", "/api/overview"), "http://panel/api/overview");
        assert_eq!(join_url("http://panel", "overview"), "http://panel/api/overview");
        assert_eq!(
            join_url("http://panel", "/apiary/list"),
            "http://panel/api/apiary/list"
        );
    }

    #[tokio::test]
    async fn success_envelope_is_passed_through() {
        let panel = StubPanel::start(vec![Reply::json(
            200,
            &serde_json::json!({
                "status": 200,
                "data": {"version": "10.2.1"},
                "time": 1_700_000_000_000_i64
            }),
        )]);
        let result = panel
            .client()
            .call(RemoteRequest::new("/overview", "GET"))
            .await;
        assert!(result.is_success());
        assert_eq!(result.time, Some(1_700_000_000_000));
        assert_eq!(result.into_result().unwrap()["version"], "10.2.1");

        let requests = panel.requests();
        assert_eq!(requests.len(), 1);
        let request = requests[0].to_ascii_lowercase();
        assert!(request.starts_with("get /api/overview?apikey=secret http/1.1"));
        assert!(request.contains("x-requested-with: xmlhttprequest"));
        assert!(request.contains("content-type: application/json"));
    }

    #[tokio::test]
    async fn query_params_follow_the_api_key() {
        let panel = StubPanel::start(vec![Reply::json(200, &serde_json::json!({"status": 200}))]);
        let result = panel
            .client()
            .call(
                RemoteRequest::new("/protected_instance/open", "get")
                    .query("uuid", "u1")
                    .query("daemonId", "n1"),
            )
            .await;
        assert_eq!(result.status, 200);
        assert!(panel.requests()[0]
            .starts_with("GET /api/protected_instance/open?apikey=secret&uuid=u1&daemonId=n1 "));
    }

    #[tokio::test]
    async fn non_json_error_body_is_truncated() {
        let body = format!("<html>{}</html>", "x".repeat(300));
        let panel = StubPanel::start(vec![Reply::new(503, body)]);
        let result = panel
            .client()
            .call(RemoteRequest::new("/overview", "GET"))
            .await;
        assert_eq!(result.status, 503);
        let error = result.error.clone().unwrap();
        assert!(error.starts_with("503: <html>xxx"));
        assert_eq!(error.len(), "503: ".len() + 100);
        assert!(matches!(
            result.into_result(),
            Err(RemoteError::Api { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn json_error_body_is_kept() {
        let panel = StubPanel::start(vec![Reply::json(
            403,
            &serde_json::json!({"status": 403, "data": "permission denied"}),
        )]);
        let result = panel
            .client()
            .call(RemoteRequest::new("/protected_instance/stop", "GET"))
            .await;
        assert_eq!(result.status, 403);
        assert_eq!(result.error_message(), "permission denied");
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_decode_failure() {
        let panel = StubPanel::start(vec![Reply::new(200, "not json")]);
        let result = panel
            .client()
            .call(RemoteRequest::new("/overview", "GET"))
            .await;
        assert_eq!(result.status, 500);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("decode failure: "));
        assert_eq!(result.failure(), FailureClass::Decode);
    }

    #[tokio::test]
    async fn unsupported_method_makes_no_call() {
        let panel = StubPanel::start(vec![Reply::json(200, &serde_json::json!({"status": 200}))]);
        let result = panel
            .client()
            .call(RemoteRequest::new("/overview", "PATCH"))
            .await;
        assert_eq!(result.status, 400);
        assert_eq!(result.error.as_deref(), Some("unsupported method"));
        assert!(panel.requests().is_empty());
    }

    #[tokio::test]
    async fn slow_response_is_a_read_timeout() {
        let mut reply = Reply::json(200, &serde_json::json!({"status": 200}));
        reply.delay = Duration::from_millis(800);
        let panel = StubPanel::start(vec![reply]);
        let client = RemoteClient::builder(panel.base_url.as_str(), "secret")
            .timeout(Duration::from_millis(150))
            .build()
            .unwrap();
        let result = client.call(RemoteRequest::new("/overview", "GET")).await;
        assert_eq!(result.status, 504);
        assert_eq!(result.error.as_deref(), Some("read timeout"));
        assert!(matches!(
            result.into_result(),
            Err(RemoteError::Transport { status: 504, .. })
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = RemoteClient::builder(format!("http://{addr}"), "secret")
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let result = client.call(RemoteRequest::new("/overview", "GET")).await;
        assert_eq!(result.status, 500);
        assert_eq!(result.failure(), FailureClass::Transport);
        assert!(!result.error_message().is_empty());
    }

    #[tokio::test]
    async fn foreign_json_error_body_falls_back_to_preview() {
        let panel = StubPanel::start(vec![Reply::json(
            403,
            &serde_json::json!({"message": "IP not whitelisted"}),
        )]);
        let result = panel
            .client()
            .call(RemoteRequest::new("/overview", "GET"))
            .await;
        assert_eq!(result.status, 403);
        assert_eq!(
            result.error_message(),
            r#"403: {"message":"IP not whitelisted"}"#
        );
    }

    #[test]
    fn odd_side_fields_keep_the_payload() {
        let fractional_time = normalize_response(
            StatusCode::OK,
            r#"{"status":200,"data":{"remote":[]},"time":1700000000000.5}"#,
        );
        assert!(fractional_time.is_success());
        assert_eq!(fractional_time.time, None);
        assert_eq!(fractional_time.data, Some(serde_json::json!({"remote": []})));

        let structured_error = normalize_response(
            StatusCode::OK,
            r#"{"status":200,"data":"ok","error":{"code":0}}"#,
        );
        assert!(structured_error.is_success());
        assert_eq!(structured_error.error.as_deref(), Some(r#"{"code":0}"#));

        let not_an_object = normalize_response(StatusCode::OK, "[1, 2]");
        assert_eq!(not_an_object.failure(), FailureClass::Decode);
    }

    #[test]
    fn data_text_is_preferred_over_error() {
        let both = normalize_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"status":500,"data":"instance is busy","error":"internal"}"#,
        );
        assert_eq!(both.error_message(), "instance is busy");
        let empty_data = normalize_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"status":500,"data":"","error":"internal"}"#,
        );
        assert_eq!(empty_data.error_message(), "internal");
        assert_eq!(
            NormalizedResult::remote_error(502, "").error_message(),
            "unknown error"
        );
    }

    #[tokio::test]
    async fn json_body_reaches_the_panel() {
        let panel = StubPanel::start(vec![Reply::json(200, &serde_json::json!({"status": 200}))]);
        let result = panel
            .client()
            .call(
                RemoteRequest::new("/protected_instance/command", "POST")
                    .query("uuid", "u1")
                    .body(serde_json::json!({"command": "say  hi"})),
            )
            .await;
        assert!(result.is_success());
        let request = &panel.requests()[0];
        assert!(request.starts_with("POST /api/protected_instance/command?apikey=secret&uuid=u1 "));
        assert!(request.ends_with(r#"{"command":"say  hi"}"#));
    }

    #[tokio::test]
    async fn scripted_transport_matches_params() {
        let transport = ScriptedTransport::new()
            .respond_when(
                "/service/remote_service_instances",
                &[("daemonId", "n2")],
                NormalizedResult::ok(serde_json::json!([])),
            );
        let hit = transport
            .call(RemoteRequest::new("/service/remote_service_instances", "GET").query("daemonId", "n2"))
            .await;
        let miss = transport
            .call(RemoteRequest::new("/service/remote_service_instances", "GET").query("daemonId", "n1"))
            .await;
        assert!(hit.is_success());
        assert_eq!(miss.status, 404);
        assert_eq!(transport.calls().len(), 2);
    }
}
