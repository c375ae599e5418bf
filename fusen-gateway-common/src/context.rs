use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::Local;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::watch;

use crate::{logs::get_uuid, model::Endpoint, url::parse_url_values};

pub const HEADER_REQUEST_ID: &str = "X-Request-Id";
pub const ATTR_REQUEST_ID: &str = "X-Request-Id";
pub const ATTR_REQUEST_TIME: &str = "X-Request-Time";

/// Inbound request data captured by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct WebRequest {
    pub method: String,
    pub uri: String,
    pub host: String,
    pub remote_addr: String,
    pub path_values: HashMap<String, String>,
    pub query_values: HashMap<String, Vec<String>>,
    pub form_values: HashMap<String, Vec<String>>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        let mut request = Self {
            method: method.to_uppercase(),
            uri: uri.to_owned(),
            ..Default::default()
        };
        request.query_values = parse_url_values(request.raw_query());
        request
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_path_value(mut self, name: &str, value: &str) -> Self {
        self.path_values.insert(name.to_owned(), value.to_owned());
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        host.clone_into(&mut self.host);
        self
    }

    pub fn with_remote_addr(mut self, remote_addr: &str) -> Self {
        remote_addr.clone_into(&mut self.remote_addr);
        self
    }

    /// Sets the raw body; url-encoded form bodies also fill `form_values`.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        if self
            .content_type()
            .contains("application/x-www-form-urlencoded")
        {
            self.form_values = parse_url_values(&String::from_utf8_lossy(&self.body));
        }
        self
    }

    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |e| e.0)
    }

    pub fn raw_query(&self) -> &str {
        self.uri.split_once('?').map_or("", |e| e.1)
    }

    pub fn content_type(&self) -> &str {
        self.header_value(http::header::CONTENT_TYPE.as_str())
            .unwrap_or_default()
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|e| e.to_str().ok())
    }
}

/// Cancels the paired [`CancelSignal`]s.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Cancels once the returned guard is dropped, e.g. with an abandoned connection future.
    pub fn drop_guard(self) -> CancelDropGuard {
        CancelDropGuard { handle: self }
    }
}

pub struct CancelDropGuard {
    handle: CancelHandle,
}

impl Drop for CancelDropGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(false);
        Self { receiver }
    }

    pub fn is_canceled(&self) -> bool {
        *self.receiver.borrow()
    }

    pub async fn canceled(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle { sender }, CancelSignal { receiver })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub elapsed: Duration,
}

/// Per-request state shared by the router, filters and transporters.
#[derive(Debug)]
pub struct Context {
    request_id: String,
    request: WebRequest,
    endpoint: Option<Arc<Endpoint>>,
    attributes: HashMap<String, Value>,
    metrics: Vec<Metric>,
    start_at: Instant,
    deadline: Option<Instant>,
    cancel: CancelSignal,
}

impl Context {
    pub fn new(request: WebRequest, cancel: CancelSignal) -> Self {
        let mut context = Self {
            request_id: String::new(),
            request: WebRequest::default(),
            endpoint: None,
            attributes: HashMap::new(),
            metrics: Vec::new(),
            start_at: Instant::now(),
            deadline: None,
            cancel: cancel.clone(),
        };
        context.reset(request, cancel);
        context
    }

    /// Re-initializes every per-request field, reusing the allocations.
    pub fn reset(&mut self, request: WebRequest, cancel: CancelSignal) {
        self.release();
        self.request_id = request
            .header_value(HEADER_REQUEST_ID)
            .filter(|e| !e.is_empty())
            .map_or_else(get_uuid, |e| e.to_owned());
        self.request = request;
        self.cancel = cancel;
        self.start_at = Instant::now();
        self.attributes.insert(
            ATTR_REQUEST_ID.to_owned(),
            Value::String(self.request_id.clone()),
        );
        self.attributes.insert(
            ATTR_REQUEST_TIME.to_owned(),
            Value::from(Local::now().timestamp_millis()),
        );
    }

    /// Drops request data so a pooled context holds nothing between requests.
    pub fn release(&mut self) {
        self.request_id.clear();
        self.request = WebRequest::default();
        self.endpoint = None;
        self.attributes.clear();
        self.metrics.clear();
        self.deadline = None;
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn request(&self) -> &WebRequest {
        &self.request
    }

    pub fn endpoint(&self) -> Option<&Arc<Endpoint>> {
        self.endpoint.as_ref()
    }

    pub fn set_endpoint(&mut self, endpoint: Arc<Endpoint>) {
        let _ = self.endpoint.insert(endpoint);
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, name: &str, value: Value) {
        self.attributes.insert(name.to_owned(), value);
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn add_metric(&mut self, name: &str, elapsed: Duration) {
        self.metrics.push(Metric {
            name: name.to_owned(),
            elapsed,
        });
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn start_at(&self) -> Instant {
        self.start_at
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        let _ = self.deadline.insert(deadline);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the client went away or the parent deadline passed.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled() || self.deadline.is_some_and(|e| Instant::now() >= e)
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Timeout of a backend call: the declared one, capped by the parent deadline.
    pub fn child_timeout(&self, timeout: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        }
    }
}

/// Reuses released [`Context`] allocations.
pub struct ContextPool {
    pool: Mutex<Vec<Context>>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn acquire(&self, request: WebRequest, cancel: CancelSignal) -> Context {
        let pooled = match self.pool.lock() {
            Ok(mut pool) => pool.pop(),
            Err(_) => None,
        };
        match pooled {
            Some(mut context) => {
                context.reset(request, cancel);
                context
            }
            None => Context::new(request, cancel),
        }
    }

    pub fn release(&self, mut context: Context) {
        context.release();
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.capacity {
                pool.push(context);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pool.lock().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(1024)
    }
}
