use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{service::value_to_string, value::MTValue};
use crate::{context::Context, error::BoxError};

pub const ATTR_DEFAULT_VALUE: &str = "default";

/// Produces a raw value without touching the request.
pub type ValueLoader = Arc<dyn Fn() -> MTValue + Send + Sync>;

/// Reads `(scope, key)` from the request context.
pub type LookupFunc = Arc<dyn Fn(&Context, &str, &str) -> Result<MTValue, BoxError> + Send + Sync>;

/// Converts a raw value into the declared class, given its generic element types.
pub type ValueResolver =
    Arc<dyn Fn(&MTValue, &str, &[String]) -> Result<Value, BoxError> + Send + Sync>;

/// Declared backend call parameter.
///
/// The `value_loader`, `lookup_func` and `value_resolver` bindings are process local
/// and attached when the owning endpoint is loaded.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Argument {
    pub name: String,
    pub class: String,
    pub generic: Vec<String>,
    pub http_scope: String,
    pub http_name: String,
    pub fields: Vec<Argument>,
    pub attributes: HashMap<String, Value>,
    #[serde(skip)]
    pub value_loader: Option<ValueLoader>,
    #[serde(skip)]
    pub lookup_func: Option<LookupFunc>,
    #[serde(skip)]
    pub value_resolver: Option<ValueResolver>,
}

impl Argument {
    pub fn new(name: &str, class: &str, http_scope: &str, http_name: &str) -> Self {
        Self {
            name: name.to_owned(),
            class: class.to_owned(),
            http_scope: http_scope.to_owned(),
            http_name: http_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn composite(name: &str, class: &str, fields: Vec<Argument>) -> Self {
        Self {
            name: name.to_owned(),
            class: class.to_owned(),
            fields,
            ..Default::default()
        }
    }

    pub fn with_default(mut self, value: &str) -> Self {
        self.attributes
            .insert(ATTR_DEFAULT_VALUE.to_owned(), Value::String(value.to_owned()));
        self
    }

    pub fn with_generic(mut self, generic: &[&str]) -> Self {
        self.generic = generic.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn default_value(&self) -> Option<String> {
        self.attributes.get(ATTR_DEFAULT_VALUE).and_then(value_to_string)
    }

    pub fn is_composite(&self) -> bool {
        !self.fields.is_empty()
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argument")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("generic", &self.generic)
            .field("http_scope", &self.http_scope)
            .field("http_name", &self.http_name)
            .field("fields", &self.fields)
            .field("attributes", &self.attributes)
            .field("value_loader", &self.value_loader.is_some())
            .field("lookup_func", &self.lookup_func.is_some())
            .field("value_resolver", &self.value_resolver.is_some())
            .finish()
    }
}
