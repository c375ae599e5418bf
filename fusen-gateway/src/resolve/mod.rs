use std::sync::Arc;

use fusen_gateway_common::{
    context::Context,
    error::{BoxError, ErrorCode, ServeError},
    model::{
        argument::{LookupFunc, ValueResolver},
        Argument, MTValue, Service,
    },
};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::lookup::default_lookup_func;
use value::ValueResolverRegistry;

pub mod value;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("lookup argument failed, name: {name}, error: {source}")]
    Lookup {
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("resolve argument failed, name: {name}, class: {class}, error: {source}")]
    Resolve {
        name: String,
        class: String,
        #[source]
        source: BoxError,
    },
}

impl From<ResolveError> for ServeError {
    fn from(error: ResolveError) -> Self {
        let error_code = match &error {
            ResolveError::Lookup { .. } => ErrorCode::ArgumentLookupFailed,
            ResolveError::Resolve { .. } => ErrorCode::ArgumentResolveFailed,
        };
        ServeError::new(error_code, error.to_string()).with_cause(error)
    }
}

/// Turns declared [`Argument`]s into typed values for a backend call.
#[derive(Clone)]
pub struct ArgumentResolver {
    resolvers: Arc<ValueResolverRegistry>,
    lookup: LookupFunc,
}

impl Default for ArgumentResolver {
    fn default() -> Self {
        Self::new(Arc::new(ValueResolverRegistry::default()))
    }
}

impl ArgumentResolver {
    pub fn new(resolvers: Arc<ValueResolverRegistry>) -> Self {
        Self {
            resolvers,
            lookup: default_lookup_func(),
        }
    }

    /// Replaces the lookup used by arguments without their own binding.
    pub fn with_lookup(mut self, lookup: LookupFunc) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn registry(&self) -> &Arc<ValueResolverRegistry> {
        &self.resolvers
    }

    /// Resolution order: value loader, composite fields, scoped lookup with
    /// default substitution, then the class resolver.
    pub fn resolve(&self, ctx: &Context, argument: &Argument) -> Result<Value, ResolveError> {
        if let Some(loader) = &argument.value_loader {
            return self.resolve_value(argument, &loader());
        }
        if argument.is_composite() {
            let mut object = Map::with_capacity(argument.fields.len() + 1);
            object.insert("class".to_owned(), Value::String(argument.class.clone()));
            for field in &argument.fields {
                object.insert(field.name.clone(), self.resolve(ctx, field)?);
            }
            return Ok(Value::Object(object));
        }
        let lookup = argument.lookup_func.as_ref().unwrap_or(&self.lookup);
        let mut value = lookup(ctx, &argument.http_scope, &argument.http_name).map_err(|source| {
            ResolveError::Lookup {
                name: argument.name.clone(),
                source,
            }
        })?;
        if !value.valid {
            if let Some(default) = argument.default_value() {
                value = MTValue::string(default);
            }
        }
        self.resolve_value(argument, &value)
    }

    fn resolve_value(&self, argument: &Argument, value: &MTValue) -> Result<Value, ResolveError> {
        let resolved = match &argument.value_resolver {
            Some(resolver) => resolver(value, &argument.class, &argument.generic),
            None => self
                .resolvers
                .resolve(value, &argument.class, &argument.generic),
        };
        resolved.map_err(|source| ResolveError::Resolve {
            name: argument.name.clone(),
            class: argument.class.clone(),
            source,
        })
    }

    /// Parallel `(classes, values)` lists, as generic RPC invocations expect them.
    pub fn resolve_all(
        &self,
        ctx: &Context,
        arguments: &[Argument],
    ) -> Result<(Vec<String>, Vec<Value>), ResolveError> {
        let mut types = Vec::with_capacity(arguments.len());
        let mut values = Vec::with_capacity(arguments.len());
        for argument in arguments {
            types.push(argument.class.clone());
            values.push(self.resolve(ctx, argument)?);
        }
        Ok((types, values))
    }

    /// Attaches lookup and resolver bindings once, when an endpoint is loaded.
    /// Bindings already present are kept.
    pub fn bind_argument(&self, argument: &mut Argument) {
        if argument.lookup_func.is_none() {
            let _ = argument.lookup_func.insert(self.lookup.clone());
        }
        if argument.value_resolver.is_none() && !argument.is_composite() {
            let resolver: ValueResolver = if argument.generic.is_empty() {
                self.resolvers.resolver_by_class(&argument.class)
            } else {
                let resolvers = self.resolvers.clone();
                Arc::new(move |value: &MTValue, class: &str, generic: &[String]| {
                    resolvers.resolve(value, class, generic)
                })
            };
            let _ = argument.value_resolver.insert(resolver);
        }
        for field in argument.fields.iter_mut() {
            self.bind_argument(field);
        }
    }

    pub fn bind_service(&self, service: &mut Service) {
        for argument in service.arguments.iter_mut() {
            self.bind_argument(argument);
        }
    }
}
