use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::argument::Argument;

pub const PROTO_HTTP: &str = "HTTP";
pub const PROTO_DUBBO: &str = "DUBBO";
pub const PROTO_GRPC: &str = "GRPC";
pub const PROTO_INAPP: &str = "INAPP";
pub const PROTO_ECHO: &str = "ECHO";

pub const ATTR_RPC_PROTO: &str = "rpc:proto";
pub const ATTR_RPC_GROUP: &str = "rpc:group";
pub const ATTR_RPC_VERSION: &str = "rpc:version";
pub const ATTR_RPC_TIMEOUT: &str = "rpc:timeout";
pub const ATTR_RPC_RETRIES: &str = "rpc:retries";

/// Backend call descriptor.
///
/// Explicit fields win over the `rpc:*` attributes, which only fill in what is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub service_id: String,
    pub alias_id: String,
    pub protocol: String,
    pub url: String,
    pub interface: String,
    pub method: String,
    pub group: String,
    pub version: String,
    pub timeout: String,
    pub retries: Option<u32>,
    pub arguments: Vec<Argument>,
    pub attributes: HashMap<String, Value>,
}

impl Service {
    /// `serviceId` when declared, `interface:method` otherwise.
    pub fn id(&self) -> String {
        if self.service_id.is_empty() {
            service_id(&self.interface, &self.method)
        } else {
            self.service_id.clone()
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.interface.is_empty() && !self.method.is_empty()
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attribute_str(&self, name: &str) -> Option<String> {
        self.attribute(name).and_then(value_to_string)
    }

    pub fn rpc_proto(&self) -> String {
        let protocol = if self.protocol.is_empty() {
            self.attribute_str(ATTR_RPC_PROTO).unwrap_or_default()
        } else {
            self.protocol.clone()
        };
        protocol.to_uppercase()
    }

    pub fn rpc_group(&self) -> String {
        or_attribute(&self.group, || self.attribute_str(ATTR_RPC_GROUP))
    }

    pub fn rpc_version(&self) -> String {
        or_attribute(&self.version, || self.attribute_str(ATTR_RPC_VERSION))
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        parse_duration(&or_attribute(&self.timeout, || {
            self.attribute_str(ATTR_RPC_TIMEOUT)
        }))
    }

    pub fn rpc_retries(&self) -> Option<u32> {
        self.retries.or_else(|| {
            self.attribute_str(ATTR_RPC_RETRIES)
                .and_then(|e| e.trim().parse().ok())
        })
    }
}

pub fn service_id(interface: &str, method: &str) -> String {
    format!("{interface}:{method}")
}

fn or_attribute(value: &str, attribute: impl FnOnce() -> Option<String>) -> String {
    if value.is_empty() {
        attribute().unwrap_or_default()
    } else {
        value.to_owned()
    }
}

pub(crate) fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(value) => Some(value.clone()),
        other => Some(other.to_string()),
    }
}

/// Accepts `500ms`, `10s`, `1m` and bare numbers, which are read as milliseconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let millis = match unit.trim() {
        "" | "ms" => number,
        "s" => number * 1_000.0,
        "m" => number * 60_000.0,
        "h" => number * 3_600_000.0,
        _ => return None,
    };
    if millis.is_finite() && millis >= 0.0 {
        Some(Duration::from_millis(millis as u64))
    } else {
        None
    }
}
