use std::{str::FromStr, sync::Arc};

use fusen_gateway_common::{
    context::Context,
    error::BoxError,
    model::{argument::LookupFunc, MTValue, MediaType},
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LookupError {
    #[error("lookup empty scope or key, scope: {scope}, key: {key}")]
    Empty { scope: String, key: String },
    #[error("lookup scope not supported: {0}")]
    UnknownScope(String),
}

/// Region of the inbound request a value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Path,
    PathMap,
    Query,
    QueryMulti,
    QueryMap,
    Form,
    FormMulti,
    FormMap,
    Param,
    Header,
    HeaderMap,
    Attr,
    Attrs,
    Body,
    Request,
    Auto,
}

impl FromStr for Scope {
    type Err = LookupError;

    fn from_str(scope: &str) -> Result<Self, Self::Err> {
        let scope = match scope.to_uppercase().as_str() {
            "PATH" => Scope::Path,
            "PATH_MAP" => Scope::PathMap,
            "QUERY" => Scope::Query,
            "QUERY_MULTI" | "QUERY_MUL" => Scope::QueryMulti,
            "QUERY_MAP" => Scope::QueryMap,
            "FORM" => Scope::Form,
            "FORM_MULTI" | "FORM_MUL" => Scope::FormMulti,
            "FORM_MAP" => Scope::FormMap,
            "PARAM" => Scope::Param,
            "HEADER" => Scope::Header,
            "HEADER_MAP" => Scope::HeaderMap,
            "ATTR" => Scope::Attr,
            "ATTRS" => Scope::Attrs,
            "BODY" => Scope::Body,
            "REQUEST" => Scope::Request,
            "AUTO" => Scope::Auto,
            _ => return Err(LookupError::UnknownScope(scope.to_owned())),
        };
        Ok(scope)
    }
}

impl Scope {
    pub fn is_query(&self) -> bool {
        matches!(self, Scope::Query | Scope::QueryMulti | Scope::QueryMap)
    }

    pub fn is_form(&self) -> bool {
        matches!(self, Scope::Form | Scope::FormMulti | Scope::FormMap)
    }
}

/// Reads `(scope, key)` from the request held by `ctx`.
pub fn lookup(ctx: &Context, scope: &str, key: &str) -> Result<MTValue, LookupError> {
    if scope.is_empty() || key.is_empty() {
        return Err(LookupError::Empty {
            scope: scope.to_owned(),
            key: key.to_owned(),
        });
    }
    let request = ctx.request();
    let value = match scope.parse::<Scope>()? {
        Scope::Path => request
            .path_values
            .get(key)
            .map_or_else(MTValue::invalid, |e| MTValue::string(e.clone())),
        Scope::PathMap => MTValue::object_map(
            request
                .path_values
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
        Scope::Query => MTValue::from_values(request.query_values.get(key)),
        Scope::QueryMulti => MTValue::string_list(
            request.query_values.get(key).cloned().unwrap_or_default(),
        ),
        Scope::QueryMap => MTValue::string_list_map(&request.query_values),
        Scope::Form => MTValue::from_values(request.form_values.get(key)),
        Scope::FormMulti => MTValue::string_list(
            request.form_values.get(key).cloned().unwrap_or_default(),
        ),
        Scope::FormMap => MTValue::string_list_map(&request.form_values),
        Scope::Param => request
            .query_values
            .get(key)
            .or_else(|| request.form_values.get(key))
            .and_then(|e| e.first())
            .map_or_else(MTValue::invalid, |e| MTValue::string(e.clone())),
        Scope::Header => lookup_header(ctx, key),
        Scope::HeaderMap => {
            let mut headers: Map<String, Value> = Map::new();
            for name in request.headers.keys() {
                let values: Vec<Value> = request
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|e| e.to_str().ok())
                    .map(|e| Value::String(e.to_owned()))
                    .collect();
                headers.insert(name.as_str().to_owned(), Value::Array(values));
            }
            MTValue {
                media_type: MediaType::STRING_LIST_MAP,
                ..MTValue::object_map(headers)
            }
        }
        Scope::Attr => lookup_attribute(ctx, key),
        Scope::Attrs => MTValue::object_map(
            ctx.attributes()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        Scope::Body => MTValue::with_media_type(
            String::from_utf8_lossy(&request.body),
            MediaType::new(request.content_type()),
        ),
        Scope::Request => match key.to_uppercase().as_str() {
            "METHOD" => MTValue::string(request.method.clone()),
            "URI" => MTValue::string(request.uri.clone()),
            "HOST" => MTValue::string(request.host.clone()),
            "REMOTEADDR" => MTValue::string(request.remote_addr.clone()),
            _ => MTValue::invalid(),
        },
        Scope::Auto => lookup_auto(ctx, key),
    };
    Ok(value)
}

fn lookup_header(ctx: &Context, key: &str) -> MTValue {
    let headers = &ctx.request().headers;
    if !headers.contains_key(key) {
        return MTValue::invalid();
    }
    let values: Vec<String> = headers
        .get_all(key)
        .iter()
        .filter_map(|e| e.to_str().ok())
        .map(|e| e.to_owned())
        .collect();
    if values.is_empty() {
        return MTValue::invalid();
    }
    MTValue::from_values(Some(&values))
}

/// Request attributes first, then the attributes declared on the matched endpoint.
fn lookup_attribute(ctx: &Context, key: &str) -> MTValue {
    ctx.attribute(key)
        .cloned()
        .or_else(|| ctx.endpoint().and_then(|e| e.attribute(key).cloned()))
        .map_or_else(MTValue::invalid, MTValue::object)
}

fn lookup_auto(ctx: &Context, key: &str) -> MTValue {
    let request = ctx.request();
    if let Some(value) = request.path_values.get(key) {
        return MTValue::string(value.clone());
    }
    let first = request
        .query_values
        .get(key)
        .or_else(|| request.form_values.get(key))
        .and_then(|e| e.first());
    if let Some(value) = first {
        return MTValue::string(value.clone());
    }
    if let Some(value) = request.header_value(key) {
        return MTValue::string(value);
    }
    lookup_attribute(ctx, key)
}

/// Looks up a `scope:key` expression; a bare key is looked up in [`Scope::Auto`].
/// Only a present, non-empty value is returned, as a string.
pub fn lookup_text(ctx: &Context, expression: &str) -> Result<Option<String>, LookupError> {
    let (scope, key) = expression.split_once(':').unwrap_or(("AUTO", expression));
    let value = lookup(ctx, scope.trim(), key.trim())?;
    if !value.valid {
        return Ok(None);
    }
    let text = match value.value {
        Value::Null => return Ok(None),
        Value::String(text) => text,
        Value::Array(values) => match values.into_iter().next() {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => return Ok(None),
        },
        other => other.to_string(),
    };
    Ok(Some(text).filter(|e| !e.is_empty()))
}

fn lookup_boxed(ctx: &Context, scope: &str, key: &str) -> Result<MTValue, BoxError> {
    lookup(ctx, scope, key).map_err(BoxError::from)
}

/// [`lookup`] as an argument binding.
pub fn default_lookup_func() -> LookupFunc {
    Arc::new(lookup_boxed)
}
