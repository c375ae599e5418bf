use fusen_gateway_common::{
    model::{Endpoint, Service},
    BoxFuture,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::RegisterError;

pub mod error;
pub mod support;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone)]
pub struct EndpointEvent {
    pub event_type: EventType,
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub event_type: EventType,
    pub service: Service,
}

/// A source of endpoint and service definitions.
///
/// `watch` pushes the current definitions and keeps the senders for later
/// changes; the streams end once every sender is dropped.
pub trait Discovery: Send + Sync {
    fn id(&self) -> &str;

    fn watch(
        &self,
        endpoints: UnboundedSender<EndpointEvent>,
        services: UnboundedSender<ServiceEvent>,
    ) -> BoxFuture<Result<(), RegisterError>>;
}
