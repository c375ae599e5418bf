use std::{collections::HashMap, sync::Arc};

use fusen_gateway_common::{
    context::Context,
    error::{BoxError, ServeError},
    model::{service, Service},
    response::ServeResponse,
    BoxFutureV2,
};
use ::http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::{propagation::TextMapPropagator, trace::TraceContextExt};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{config::TransporterConfig, resolve::ArgumentResolver};

pub mod client;
pub mod dubbo;
pub mod echo;
pub mod http;
pub mod inapp;

/// Converts a transporter's raw result into the gateway response envelope.
pub type TransporterCodec<T> = Arc<dyn Fn(T) -> Result<ServeResponse, BoxError> + Send + Sync>;

pub trait Transporter: Send + Sync {
    fn do_invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<ServeResponse, ServeError>>;
}

/// Transporters keyed by their uppercase protocol name.
#[derive(Default)]
pub struct TransporterRegistry {
    transporters: HashMap<String, Arc<dyn Transporter>>,
}

impl TransporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in HTTP, DUBBO, INAPP and ECHO transporters.
    pub fn with_defaults(resolver: ArgumentResolver, config: &TransporterConfig) -> Self {
        let client = Arc::new(client::UpstreamClient::new(&config.client));
        let mut registry = Self::new();
        registry.register_transporter(
            service::PROTO_HTTP,
            Arc::new(http::HttpTransporter::new(
                client.clone(),
                resolver.clone(),
                &config.http,
            )),
        );
        registry.register_transporter(
            service::PROTO_DUBBO,
            Arc::new(dubbo::DubboTransporter::new(
                Arc::new(dubbo::triple::TripleServiceFactory::new(client)),
                resolver.clone(),
                &config.dubbo,
            )),
        );
        registry.register_transporter(
            service::PROTO_INAPP,
            Arc::new(inapp::InAppTransporter::new(resolver)),
        );
        registry.register_transporter(service::PROTO_ECHO, Arc::new(echo::EchoTransporter::new()));
        registry
    }

    pub fn register_transporter(&mut self, proto: &str, transporter: Arc<dyn Transporter>) {
        self.transporters
            .insert(proto.to_uppercase(), transporter);
    }

    pub fn transporter_by_proto(&self, proto: &str) -> Option<Arc<dyn Transporter>> {
        self.transporters.get(&proto.to_uppercase()).cloned()
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.transporters.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    /// Dispatches by the service protocol, failing on protocols nobody registered.
    pub async fn do_invoke_codec(
        &self,
        ctx: &Context,
        service: &Service,
    ) -> Result<ServeResponse, ServeError> {
        let proto = service.rpc_proto();
        let transporter = self
            .transporter_by_proto(&proto)
            .ok_or_else(|| ServeError::protocol_unknown(&proto))?;
        transporter.do_invoke(ctx, service).await
    }
}

/// W3C trace context of the current span, empty outside a sampled trace.
pub(crate) fn trace_context_headers() -> HashMap<String, String> {
    let context = tracing::Span::current().context();
    let mut carrier = HashMap::new();
    if context.span().span_context().is_valid() {
        TraceContextPropagator::new().inject_context(&context, &mut carrier);
    }
    carrier
}

/// Copies string pairs into `headers`, skipping names or values HTTP rejects.
pub(crate) fn insert_headers<'a, I>(headers: &mut HeaderMap, pairs: I)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}
