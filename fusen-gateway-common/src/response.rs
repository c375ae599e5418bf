use std::collections::HashMap;

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Value(Value),
}

impl ResponseBody {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ResponseBody::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Interprets the body as a json document; raw bytes are parsed, empty is `Null`.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ResponseBody::Empty => Ok(Value::Null),
            ResponseBody::Bytes(bytes) => serde_json::from_slice(bytes),
            ResponseBody::Value(value) => Ok(value.clone()),
        }
    }
}

/// Normalized backend result.
///
/// `attachments` are copied into the request attributes once the response
/// reaches the router, so later backend calls of the same request see them.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub attachments: HashMap<String, Value>,
}

impl Default for ServeResponse {
    fn default() -> Self {
        Self::new(200, ResponseBody::Empty)
    }
}

impl ServeResponse {
    pub fn new(status_code: u16, body: ResponseBody) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body,
            attachments: HashMap::new(),
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, ResponseBody::Value(body))
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_attachments(mut self, attachments: HashMap<String, Value>) -> Self {
        self.attachments = attachments;
        self
    }
}
