use std::{sync::Arc, time::Instant};

use fusen_gateway_common::{
    context::Context,
    error::{ErrorCode, ServeError},
    model::{Endpoint, Service},
    BoxFutureV2,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Filter, FilterResult, FilterSelector, ProceedingJoinPoint};
use crate::{endpoint::service::ServiceRegistry, transporter::TransporterRegistry};

pub const PERMISSION_FILTER_ID: &str = "permission_filter";
pub const PERMISSION_SERVICE_NOT_FOUND: &str = "PERMISSION:SERVICE:NOT_FOUND";
pub const PERMISSION_ACCESS_DENIED: &str = "PERMISSION:ACCESS_DENIED";

/// What a permission service answers; a bare json boolean is also accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionReport {
    pub success: bool,
    pub status_code: u16,
    pub error_code: String,
    pub message: String,
}

impl PermissionReport {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Bool(success) => Ok(Self {
                success: *success,
                ..Default::default()
            }),
            other => PermissionReport::deserialize(other),
        }
    }

    fn into_error(self) -> ServeError {
        let error_code = if self.error_code.is_empty() {
            ErrorCode::PermissionDenied
        } else {
            ErrorCode::Custom(self.error_code)
        };
        let message = if self.message.is_empty() {
            PERMISSION_ACCESS_DENIED.to_owned()
        } else {
            self.message
        };
        let status_code = if self.status_code < 100 {
            403
        } else {
            self.status_code
        };
        ServeError::new(error_code, message).with_status(status_code)
    }
}

/// Asks every permission service of the endpoint before the backend call.
pub struct PermissionFilter {
    transporters: Arc<TransporterRegistry>,
    services: Arc<ServiceRegistry>,
}

impl PermissionFilter {
    pub fn new(transporters: Arc<TransporterRegistry>, services: Arc<ServiceRegistry>) -> Self {
        Self {
            transporters,
            services,
        }
    }

    fn permission_services(&self, endpoint: &Endpoint) -> Result<Vec<Arc<Service>>, ServeError> {
        let mut services = Vec::new();
        if let Some(permission) = endpoint.permission.as_ref().filter(|e| e.is_valid()) {
            services.push(Arc::new(permission.clone()));
        }
        for id in endpoint.permission_ids() {
            let service = self.services.lookup_service_by_id(&id).ok_or_else(|| {
                ServeError::new(
                    ErrorCode::Custom(PERMISSION_SERVICE_NOT_FOUND.to_owned()),
                    format!("permission service not found, id: {id}"),
                )
                .with_status(403)
            })?;
            services.push(service);
        }
        Ok(services)
    }

    async fn verify(&self, ctx: &Context) -> Result<(), ServeError> {
        let Some(endpoint) = ctx.endpoint() else {
            return Ok(());
        };
        for service in self.permission_services(endpoint)? {
            let response = self.transporters.do_invoke_codec(ctx, &service).await?;
            let report = response
                .body
                .to_value()
                .and_then(|e| PermissionReport::from_value(&e))
                .map_err(|error| {
                    ServeError::decode(
                        format!("illegal permission report, service: {}", service.id()),
                        error,
                    )
                })?;
            if !report.success {
                debug!(service = %service.id(), ?report, "permission denied");
                return Err(report.into_error());
            }
        }
        Ok(())
    }
}

impl Filter for PermissionFilter {
    fn filter_id(&self) -> &str {
        PERMISSION_FILTER_ID
    }

    fn order(&self) -> i32 {
        -100
    }

    fn call<'a>(&'a self, join_point: ProceedingJoinPoint<'a>) -> BoxFutureV2<'a, FilterResult> {
        Box::pin(async move {
            let start = Instant::now();
            let verified = self.verify(join_point.context).await;
            join_point
                .context
                .add_metric(PERMISSION_FILTER_ID, start.elapsed());
            verified?;
            join_point.proceed().await
        })
    }
}

/// Activates the [`PermissionFilter`] on endpoints that declare permissions.
pub struct PermissionFilterSelector {
    filter: Arc<dyn Filter>,
}

impl PermissionFilterSelector {
    pub fn new(filter: Arc<PermissionFilter>) -> Self {
        Self { filter }
    }
}

impl FilterSelector for PermissionFilterSelector {
    fn activate(&self, ctx: &Context) -> bool {
        ctx.endpoint().is_some_and(|endpoint| {
            endpoint.permission.as_ref().is_some_and(|e| e.is_valid())
                || !endpoint.permission_ids().is_empty()
        })
    }

    fn do_select(&self, _ctx: &Context) -> Vec<Arc<dyn Filter>> {
        vec![self.filter.clone()]
    }
}
