use std::{collections::HashMap, sync::Arc, time::Duration};

use fusen_gateway_common::{
    context::Context,
    error::{BoxError, ErrorCode, ServeError},
    model::Service,
    response::{ResponseBody, ServeResponse},
    BoxFutureV2,
};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Transporter, TransporterCodec};
use crate::{config::DubboTransporterConfig, resolve::ArgumentResolver};

pub mod triple;

/// Attachment carrying the HTTP status the gateway should answer with.
pub const ATTACHMENT_HTTP_STATUS: &str = "@gateway/http.status";
/// Attachment carrying extra response headers, as a json object.
pub const ATTACHMENT_HTTP_HEADERS: &str = "@gateway/http.headers";

/// Where and how a generic reference reaches its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceConfig {
    pub url: String,
    pub interface: String,
    pub group: String,
    pub version: String,
    pub timeout: Duration,
    pub retries: u32,
    pub cluster: String,
    pub load_balance: String,
}

pub const CLUSTER_FAILOVER: &str = "failover";
pub const CLUSTER_FAILFAST: &str = "failfast";

impl ReferenceConfig {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.interface, self.group, self.version)
    }

    /// `failover` tries `retries` more times after a remote failure, any other cluster once.
    pub fn attempts(&self) -> u32 {
        if self.cluster.eq_ignore_ascii_case(CLUSTER_FAILOVER) {
            self.retries.saturating_add(1)
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenericRequest {
    pub method: String,
    pub types: Vec<String>,
    pub values: Vec<Value>,
    pub attachments: HashMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericResult {
    pub value: Value,
    pub attachments: HashMap<String, Value>,
}

/// A generic-invocation client bound to one remote interface.
pub trait GenericService: Send + Sync {
    fn invoke(&self, request: GenericRequest) -> BoxFutureV2<'_, Result<GenericResult, BoxError>>;
}

pub trait GenericServiceFactory: Send + Sync {
    fn create(&self, config: &ReferenceConfig) -> Result<Arc<dyn GenericService>, BoxError>;
}

/// Generic RPC transporter; one cached reference per interface, group and version.
pub struct DubboTransporter {
    factory: Arc<dyn GenericServiceFactory>,
    resolver: ArgumentResolver,
    references: Mutex<HashMap<String, Arc<dyn GenericService>>>,
    config: DubboTransporterConfig,
    codec: TransporterCodec<GenericResult>,
}

impl DubboTransporter {
    pub fn new(
        factory: Arc<dyn GenericServiceFactory>,
        resolver: ArgumentResolver,
        config: &DubboTransporterConfig,
    ) -> Self {
        Self {
            factory,
            resolver,
            references: Mutex::default(),
            config: config.clone(),
            codec: Arc::new(dubbo_codec),
        }
    }

    pub fn with_codec(mut self, codec: TransporterCodec<GenericResult>) -> Self {
        self.codec = codec;
        self
    }

    fn reference_config(&self, service: &Service) -> ReferenceConfig {
        ReferenceConfig {
            url: service.url.clone(),
            interface: service.interface.clone(),
            group: service.rpc_group(),
            version: service.rpc_version(),
            timeout: service.rpc_timeout().unwrap_or(self.config.timeout()),
            retries: service.rpc_retries().unwrap_or(self.config.retries),
            cluster: self.config.cluster.clone(),
            load_balance: self.config.load_balance.clone(),
        }
    }

    /// Reuses the cached reference, creating it on first use.
    async fn load_generic_service(
        &self,
        config: &ReferenceConfig,
    ) -> Result<Arc<dyn GenericService>, ServeError> {
        let key = config.key();
        let mut references = self.references.lock().await;
        if let Some(reference) = references.get(&key) {
            return Ok(reference.clone());
        }
        let reference = self.factory.create(config).map_err(|error| {
            ServeError::assemble(format!("create generic reference failed: {key}"), error)
        })?;
        tokio::time::sleep(self.config.reference_delay()).await;
        info!(reference = %key, url = %config.url, "generic reference created");
        references.insert(key, reference.clone());
        Ok(reference)
    }
}

impl Transporter for DubboTransporter {
    fn do_invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<ServeResponse, ServeError>> {
        Box::pin(async move {
            let (types, values) = self.resolver.resolve_all(ctx, &service.arguments)?;
            let attachments = ctx
                .attributes()
                .iter()
                .filter_map(|(name, value)| match value {
                    Value::Null => None,
                    Value::String(value) => Some((name.clone(), value.clone())),
                    other => Some((name.clone(), other.to_string())),
                })
                .collect();
            let config = self.reference_config(service);
            let reference = self.load_generic_service(&config).await?;
            let timeout = ctx.child_timeout(config.timeout);
            debug!(service = %service.id(), ?types, ?timeout, "dubbo transporter invoke");
            let request = GenericRequest {
                method: service.method.clone(),
                types,
                values,
                attachments,
                timeout,
            };
            let invoked = failover(reference.as_ref(), request, config.attempts());
            let result = tokio::time::timeout(timeout, invoked)
                .await
                .map_err(|_| {
                    ServeError::new(
                        ErrorCode::BackendTimeout,
                        format!("dubbo invoke timeout after {timeout:?}"),
                    )
                })?
                .map_err(|error| ServeError::remote("dubbo remote invoke failed", error))?;
            (self.codec)(result)
                .map_err(|error| ServeError::decode("dubbo response decode failed", error))
        })
    }
}

/// Retries remote failures; the caller's timeout bounds all attempts together.
async fn failover(
    reference: &dyn GenericService,
    request: GenericRequest,
    attempts: u32,
) -> Result<GenericResult, BoxError> {
    let mut attempt = 1;
    loop {
        match reference.invoke(request.clone()).await {
            Ok(result) => return Ok(result),
            Err(error) if attempt < attempts => {
                warn!(attempt, method = %request.method, %error, "dubbo invoke failed, retry");
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Reads the reserved status and header attachments; the rest stay attachments.
pub fn dubbo_codec(result: GenericResult) -> Result<ServeResponse, BoxError> {
    let mut attachments = result.attachments;
    let status_code = match attachments.remove(ATTACHMENT_HTTP_STATUS) {
        None | Some(Value::Null) => 200,
        Some(Value::Number(number)) => number
            .as_u64()
            .and_then(|e| u16::try_from(e).ok())
            .ok_or_else(|| format!("illegal http status: {number}"))?,
        Some(Value::String(status)) => status
            .trim()
            .parse()
            .map_err(|_| format!("illegal http status: {status}"))?,
        Some(other) => return Err(format!("illegal http status: {other}").into()),
    };
    let mut headers = HeaderMap::new();
    match attachments.remove(ATTACHMENT_HTTP_HEADERS) {
        None | Some(Value::Null) => {}
        Some(Value::Object(values)) => {
            for (name, value) in values {
                let name = HeaderName::from_bytes(name.as_bytes())?;
                let values = match value {
                    Value::Array(values) => values,
                    other => vec![other],
                };
                for value in values {
                    let value = match value {
                        Value::String(value) => HeaderValue::from_str(&value)?,
                        other => HeaderValue::from_str(&other.to_string())?,
                    };
                    headers.append(name.clone(), value);
                }
            }
        }
        Some(other) => return Err(format!("illegal http headers: {other}").into()),
    }
    let body = match result.value {
        Value::Null => ResponseBody::Empty,
        value => ResponseBody::Value(value),
    };
    Ok(ServeResponse::new(status_code, body)
        .with_headers(headers)
        .with_attachments(attachments))
}
