use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use fusen_gateway_common::{
    context::Context, error::ServeError, model::Service, response::ServeResponse, BoxFutureV2,
};
use serde_json::{Map, Value};

use super::{Transporter, TransporterCodec};
use crate::resolve::ArgumentResolver;

pub const ECHO_SERVICE_ID: &str = "fusen.gateway.debug.InApp:echo";

/// A handler running inside the gateway process.
pub trait InAppInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<Value, ServeError>>;
}

/// Returns the resolved arguments keyed by name.
pub struct EchoArgumentsInvoker {
    resolver: ArgumentResolver,
}

impl InAppInvoker for EchoArgumentsInvoker {
    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<Value, ServeError>> {
        Box::pin(async move {
            let mut values = Map::with_capacity(service.arguments.len());
            for argument in &service.arguments {
                values.insert(argument.name.clone(), self.resolver.resolve(ctx, argument)?);
            }
            Ok(Value::Object(values))
        })
    }
}

/// Dispatches to in-process invokers keyed by service id.
pub struct InAppTransporter {
    invokers: RwLock<HashMap<String, Arc<dyn InAppInvoker>>>,
    codec: TransporterCodec<Value>,
}

impl InAppTransporter {
    pub fn new(resolver: ArgumentResolver) -> Self {
        let transporter = Self {
            invokers: Default::default(),
            codec: Arc::new(|value: Value| Ok(ServeResponse::ok(value))),
        };
        transporter.register_invoker(ECHO_SERVICE_ID, Arc::new(EchoArgumentsInvoker { resolver }));
        transporter
    }

    pub fn with_codec(mut self, codec: TransporterCodec<Value>) -> Self {
        self.codec = codec;
        self
    }

    pub fn register_invoker(&self, service_id: &str, invoker: Arc<dyn InAppInvoker>) {
        self.invokers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service_id.to_owned(), invoker);
    }

    fn invoker(&self, service_id: &str) -> Option<Arc<dyn InAppInvoker>> {
        self.invokers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .cloned()
    }
}

impl Transporter for InAppTransporter {
    fn do_invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<ServeResponse, ServeError>> {
        Box::pin(async move {
            let service_id = service.id();
            let invoker = self.invoker(&service_id).ok_or_else(|| {
                ServeError::internal(format!("in-app invoker not found, service: {service_id}"))
            })?;
            let value = invoker.invoke(ctx, service).await?;
            (self.codec)(value)
                .map_err(|error| ServeError::decode("in-app response decode failed", error))
        })
    }
}
