use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::service::{value_to_string, Service};

pub const ATTR_TAG_LISTENER_ID: &str = "tag:listenerId";
pub const ATTR_TAG_AUTHORIZE: &str = "tag:authorize";
pub const ATTR_TAG_BIZ_ID: &str = "tag:bizId";
pub const ATTR_TAG_PERMISSION: &str = "tag:permission";
pub const ATTR_TAG_STATIC_MODEL: &str = "tag:staticModel";

pub const DEFAULT_LISTENER_ID: &str = "default";

pub const ALLOWED_HTTP_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

/// One versioned binding of an HTTP method and pattern to a backend [`Service`].
///
/// Endpoints are shared as `Arc<Endpoint>` and never mutated once registered;
/// an update always swaps in a new value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoint {
    pub application: String,
    pub version: String,
    pub http_method: String,
    pub http_pattern: String,
    pub service: Service,
    pub permission: Option<Service>,
    pub permissions: Vec<String>,
    pub authorize: bool,
    pub attributes: HashMap<String, Value>,
}

impl Endpoint {
    pub fn route_key(&self) -> String {
        route_key(&self.http_method, &self.http_pattern)
    }

    pub fn is_valid(&self) -> bool {
        !self.http_method.is_empty()
            && !self.http_pattern.is_empty()
            && (self.service.is_valid() || !self.service.service_id.is_empty())
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attribute_str(&self, name: &str) -> Option<String> {
        self.attribute(name).and_then(value_to_string)
    }

    pub fn listener_id(&self) -> String {
        self.attribute_str(ATTR_TAG_LISTENER_ID)
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTENER_ID.to_owned())
    }

    pub fn is_authorize(&self) -> bool {
        self.authorize || self.attribute(ATTR_TAG_AUTHORIZE).is_some_and(is_truthy)
    }

    pub fn is_static_model(&self) -> bool {
        self.attribute(ATTR_TAG_STATIC_MODEL).is_some_and(is_truthy)
    }

    /// Ids of permission services, declared either as a field or as the `tag:permission` attribute.
    pub fn permission_ids(&self) -> Vec<String> {
        let mut ids = self.permissions.clone();
        match self.attribute(ATTR_TAG_PERMISSION) {
            Some(Value::Array(values)) => ids.extend(values.iter().filter_map(value_to_string)),
            Some(Value::String(value)) => ids.extend(
                value
                    .split(',')
                    .map(|e| e.trim().to_owned())
                    .filter(|e| !e.is_empty()),
            ),
            _ => {}
        }
        ids
    }
}

pub fn route_key(method: &str, pattern: &str) -> String {
    format!("{}#{}", method.to_uppercase(), pattern)
}

pub fn is_allowed_method(method: &str) -> bool {
    let method = method.to_uppercase();
    ALLOWED_HTTP_METHODS.contains(&method.as_str())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(value) => *value,
        Value::String(value) => value.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
