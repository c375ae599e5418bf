use std::{collections::HashMap, sync::Arc};

use fusen_gateway_common::{
    error::BoxError,
    model::{argument::ValueResolver, MTValue, MediaType},
    url::parse_url_values,
};
use serde_json::{json, Map, Number, Value};

pub const DEFAULT_RESOLVER_NAME: &str = "default";

/// Class name keyed conversion table.
///
/// Names are matched case-insensitively; unknown names fall back to the
/// structured passthrough resolver registered as `default`.
pub struct ValueResolverRegistry {
    resolvers: HashMap<String, ValueResolver>,
}

impl Default for ValueResolverRegistry {
    fn default() -> Self {
        let mut registry = Self {
            resolvers: HashMap::new(),
        };
        registry.register_all(&["string", "java.lang.String"], Arc::new(resolve_string));
        registry.register_all(&["int", "integer", "java.lang.Integer"], Arc::new(resolve_int));
        registry.register_all(&["long", "int64", "java.lang.Long"], Arc::new(resolve_long));
        registry.register_all(&["float", "float32", "java.lang.Float"], Arc::new(resolve_float));
        registry.register_all(
            &["double", "float64", "java.lang.Double"],
            Arc::new(resolve_double),
        );
        registry.register_all(&["bool", "boolean", "java.lang.Boolean"], Arc::new(resolve_bool));
        registry.register_all(&["map", "java.util.Map"], Arc::new(resolve_map));
        registry.register_all(&["list", "slice", "java.util.List"], Arc::new(resolve_list_plain));
        registry.register_all(
            &["object", "java.lang.Object", "java.io.Serializable"],
            Arc::new(resolve_object),
        );
        registry.register(DEFAULT_RESOLVER_NAME, Arc::new(resolve_complex));
        registry
    }
}

impl ValueResolverRegistry {
    pub fn register(&mut self, class_name: &str, resolver: ValueResolver) {
        self.resolvers.insert(class_name.to_lowercase(), resolver);
    }

    fn register_all(&mut self, class_names: &[&str], resolver: ValueResolver) {
        for class_name in class_names {
            self.register(class_name, resolver.clone());
        }
    }

    /// An empty class resolves as `string`.
    pub fn resolver_by_class(&self, class_name: &str) -> ValueResolver {
        let class_name = if class_name.is_empty() {
            "string".to_owned()
        } else {
            class_name.to_lowercase()
        };
        self.resolvers
            .get(&class_name)
            .or_else(|| self.resolvers.get(DEFAULT_RESOLVER_NAME))
            .cloned()
            .unwrap_or_else(|| -> ValueResolver { Arc::new(resolve_complex) })
    }

    /// Resolves `value` into `class`, converting list elements with the
    /// resolver of the first generic type.
    pub fn resolve(
        &self,
        value: &MTValue,
        class: &str,
        generic: &[String],
    ) -> Result<Value, BoxError> {
        if is_list_class(class) {
            return self.resolve_list(value, generic);
        }
        (self.resolver_by_class(class))(value, class, generic)
    }

    fn resolve_list(&self, value: &MTValue, generic: &[String]) -> Result<Value, BoxError> {
        let Some(element_class) = generic.first() else {
            return resolve_list_plain(value, "list", generic);
        };
        if is_empty_or_null(&value.value) {
            return Ok(Value::Array(vec![]));
        }
        let resolver = self.resolver_by_class(element_class);
        let elements = match as_array(&value.value) {
            Some(elements) => elements,
            None => return Ok(Value::Array(vec![resolver(value, element_class, &[])?])),
        };
        elements
            .into_iter()
            .map(|e| resolver(&MTValue::object(e), element_class, &[]))
            .collect::<Result<Vec<Value>, BoxError>>()
            .map(Value::Array)
    }
}

fn is_list_class(class: &str) -> bool {
    matches!(
        class.to_lowercase().as_str(),
        "list" | "slice" | "java.util.list"
    )
}

fn is_empty_or_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(value) => value.is_empty(),
        _ => false,
    }
}

fn as_array(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(values) => Some(values.clone()),
        Value::String(text) if text.trim_start().starts_with('[') => {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(values)) => Some(values),
                _ => None,
            }
        }
        _ => None,
    }
}

fn resolve_string(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    let text = match &value.value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        other => serde_json::to_string(other)?,
    };
    Ok(Value::String(text))
}

fn to_i64(value: &Value) -> Result<i64, BoxError> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().and_then(integral))
            .ok_or_else(|| format!("unable to cast {number} to integer").into()),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(integral))
                .ok_or_else(|| format!("unable to cast {text:?} to integer").into())
        }
        Value::Bool(flag) => Ok(i64::from(*flag)),
        Value::Array(values) if values.len() == 1 => to_i64(&values[0]),
        other => Err(format!("unable to cast {other} to integer").into()),
    }
}

/// `2.0` and `1e3` are integers, `1.9` and `NaN` are not.
fn integral(value: f64) -> Option<i64> {
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    (value.is_finite() && value.fract() == 0.0 && in_range).then_some(value as i64)
}

fn to_f64(value: &Value) -> Result<f64, BoxError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| format!("unable to cast {number} to float").into()),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("unable to cast {text:?} to float").into()),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        Value::Array(values) if values.len() == 1 => to_f64(&values[0]),
        other => Err(format!("unable to cast {other} to float").into()),
    }
}

fn resolve_int(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    if is_empty_or_null(&value.value) {
        return Ok(json!(0));
    }
    let number = to_i64(&value.value)?;
    let number = i32::try_from(number).map_err(|_| format!("integer overflow: {number}"))?;
    Ok(json!(number))
}

fn resolve_long(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    if is_empty_or_null(&value.value) {
        return Ok(json!(0));
    }
    Ok(json!(to_i64(&value.value)?))
}

fn float_value(number: f64) -> Result<Value, BoxError> {
    Number::from_f64(number)
        .map(Value::Number)
        .ok_or_else(|| format!("unable to represent float {number}").into())
}

fn resolve_float(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    if is_empty_or_null(&value.value) {
        return float_value(0.0);
    }
    float_value(to_f64(&value.value)? as f32 as f64)
}

fn resolve_double(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    if is_empty_or_null(&value.value) {
        return float_value(0.0);
    }
    float_value(to_f64(&value.value)?)
}

fn resolve_bool(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    fn to_bool(value: &Value) -> Result<bool, BoxError> {
        match value {
            Value::Bool(flag) => Ok(*flag),
            Value::Number(number) => Ok(number.as_f64().is_some_and(|e| e != 0.0)),
            Value::String(text) => match text.trim() {
                "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
                "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
                other => Err(format!("unable to cast {other:?} to bool").into()),
            },
            Value::Array(values) if values.len() == 1 => to_bool(&values[0]),
            other => Err(format!("unable to cast {other} to bool").into()),
        }
    }
    if is_empty_or_null(&value.value) {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Bool(to_bool(&value.value)?))
}

/// Objects pass through; text is decoded as json, or as a url-encoded form when
/// the media type says so.
fn to_map(value: &MTValue) -> Result<Map<String, Value>, BoxError> {
    match &value.value {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        Value::String(text) if text.is_empty() => Ok(Map::new()),
        Value::String(text) if value.media_type.is_form() => Ok(parse_url_values(text)
            .into_iter()
            .map(|(key, mut values)| {
                let value = if values.len() == 1 {
                    Value::String(values.remove(0))
                } else {
                    Value::Array(values.into_iter().map(Value::String).collect())
                };
                (key, value)
            })
            .collect()),
        Value::String(text)
            if value.media_type == MediaType::STRING
                || value.media_type.is_json()
                || text.trim_start().starts_with('{') =>
        {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(other) => Err(format!("cannot decode text to map, text: {other}").into()),
                Err(error) => {
                    Err(format!("cannot decode text to map, text: {text}, error: {error}").into())
                }
            }
        }
        other => Err(format!(
            "unsupported media type to map, value: {other}, media type: {}",
            value.media_type.as_str()
        )
        .into()),
    }
}

fn resolve_map(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    to_map(value).map(Value::Object)
}

fn resolve_object(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    Ok(value.value.clone())
}

/// Lists without element conversion; [`ValueResolverRegistry::resolve`] handles generics.
fn resolve_list_plain(value: &MTValue, _: &str, _: &[String]) -> Result<Value, BoxError> {
    if is_empty_or_null(&value.value) {
        return Ok(Value::Array(vec![]));
    }
    Ok(Value::Array(
        as_array(&value.value).unwrap_or_else(|| vec![value.value.clone()]),
    ))
}

fn resolve_complex(value: &MTValue, class: &str, generic: &[String]) -> Result<Value, BoxError> {
    Ok(json!({
        "class": class,
        "generic": generic,
        "value": value.value,
    }))
}
