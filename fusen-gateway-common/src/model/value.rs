use std::{borrow::Cow, collections::HashMap};

use serde_json::{Map, Value};

/// Describes how the raw value inside an [`MTValue`] is shaped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType(Cow<'static, str>);

impl MediaType {
    pub const OBJECT: MediaType = MediaType(Cow::Borrowed("value:object"));
    pub const STRING: MediaType = MediaType(Cow::Borrowed("value:string"));
    pub const STRING_LIST: MediaType = MediaType(Cow::Borrowed("value:[]string"));
    pub const OBJECT_MAP: MediaType = MediaType(Cow::Borrowed("value:map[string]object"));
    pub const STRING_LIST_MAP: MediaType =
        MediaType(Cow::Borrowed("value:map[string][]string"));

    /// A declared content type, used for raw bodies.
    pub fn new(media_type: impl Into<String>) -> Self {
        MediaType(Cow::Owned(media_type.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_json(&self) -> bool {
        self.0.contains("application/json")
    }

    pub fn is_form(&self) -> bool {
        self.0.contains("application/x-www-form-urlencoded")
    }
}

/// Result of a scoped lookup.
///
/// `valid == false` means the key was absent, which is different from a present
/// key holding the empty string.
#[derive(Debug, Clone, PartialEq)]
pub struct MTValue {
    pub valid: bool,
    pub value: Value,
    pub media_type: MediaType,
}

impl MTValue {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            value: Value::Null,
            media_type: MediaType::OBJECT,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            valid: true,
            value: Value::String(value.into()),
            media_type: MediaType::STRING,
        }
    }

    pub fn string_list(values: Vec<String>) -> Self {
        Self {
            valid: true,
            value: Value::Array(values.into_iter().map(Value::String).collect()),
            media_type: MediaType::STRING_LIST,
        }
    }

    pub fn object(value: Value) -> Self {
        Self {
            valid: !value.is_null(),
            value,
            media_type: MediaType::OBJECT,
        }
    }

    pub fn object_map(values: Map<String, Value>) -> Self {
        Self {
            valid: true,
            value: Value::Object(values),
            media_type: MediaType::OBJECT_MAP,
        }
    }

    pub fn string_list_map(values: &HashMap<String, Vec<String>>) -> Self {
        let values = values
            .iter()
            .map(|(key, list)| {
                let list = list.iter().cloned().map(Value::String).collect();
                (key.clone(), Value::Array(list))
            })
            .collect();
        Self {
            valid: true,
            value: Value::Object(values),
            media_type: MediaType::STRING_LIST_MAP,
        }
    }

    /// Raw text carrying its declared content type.
    pub fn with_media_type(value: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            valid: true,
            value: Value::String(value.into()),
            media_type,
        }
    }

    /// Collapses a multi-valued container entry: one value becomes a string,
    /// several become a list, an absent key is invalid.
    pub fn from_values(values: Option<&Vec<String>>) -> Self {
        match values {
            None => Self::invalid(),
            Some(values) if values.len() == 1 => Self::string(values[0].clone()),
            Some(values) if values.is_empty() => Self::string(""),
            Some(values) => Self::string_list(values.clone()),
        }
    }
}
