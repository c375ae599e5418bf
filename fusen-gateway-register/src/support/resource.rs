use std::collections::HashMap;

use fusen_gateway_common::{
    config::get_config_by_file,
    model::{Endpoint, Service},
    BoxFuture,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::{error::RegisterError, Discovery, EndpointEvent, EventType, ServiceEvent};

/// A document of endpoint and service definitions, as stored in files or a config center.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryResource {
    pub endpoints: Vec<Endpoint>,
    pub services: Vec<Service>,
}

impl DiscoveryResource {
    pub fn load(path: &str) -> Result<Self, RegisterError> {
        get_config_by_file(path).map_err(RegisterError::Error)
    }

    pub fn merge(mut self, other: DiscoveryResource) -> Self {
        self.endpoints.extend(other.endpoints);
        self.services.extend(other.services);
        self
    }
}

/// Loads definitions once from toml or yaml files.
pub struct ResourceDiscovery {
    id: String,
    paths: Vec<String>,
    resources: DiscoveryResource,
}

impl ResourceDiscovery {
    pub fn new(paths: Vec<String>) -> Self {
        Self {
            id: "resource".to_owned(),
            paths,
            resources: DiscoveryResource::default(),
        }
    }

    /// Definitions given in code, emitted before any file content.
    pub fn with_resources(mut self, resources: DiscoveryResource) -> Self {
        self.resources = self.resources.merge(resources);
        self
    }
}

impl Discovery for ResourceDiscovery {
    fn id(&self) -> &str {
        &self.id
    }

    fn watch(
        &self,
        endpoints: UnboundedSender<EndpointEvent>,
        services: UnboundedSender<ServiceEvent>,
    ) -> BoxFuture<Result<(), RegisterError>> {
        let paths = self.paths.clone();
        let mut resources = self.resources.clone();
        Box::pin(async move {
            for path in paths {
                info!("load discovery resource: {path}");
                resources = resources.merge(DiscoveryResource::load(&path)?);
            }
            let (endpoint_events, service_events) =
                diff_resources(&DiscoveryResource::default(), &resources);
            send_events(&endpoints, &services, endpoint_events, service_events)
        })
    }
}

pub(crate) fn send_events(
    endpoints: &UnboundedSender<EndpointEvent>,
    services: &UnboundedSender<ServiceEvent>,
    endpoint_events: Vec<EndpointEvent>,
    service_events: Vec<ServiceEvent>,
) -> Result<(), RegisterError> {
    for event in service_events {
        services.send(event).map_err(|_| RegisterError::Closed)?;
    }
    for event in endpoint_events {
        endpoints.send(event).map_err(|_| RegisterError::Closed)?;
    }
    Ok(())
}

/// Events turning `old` into `new`. Endpoints are keyed by route key and version,
/// services by id.
pub fn diff_resources(
    old: &DiscoveryResource,
    new: &DiscoveryResource,
) -> (Vec<EndpointEvent>, Vec<ServiceEvent>) {
    let endpoint_key = |e: &Endpoint| format!("{}@{}", e.route_key(), e.version);
    let endpoints = diff(&old.endpoints, &new.endpoints, endpoint_key)
        .into_iter()
        .map(|(event_type, endpoint)| EndpointEvent {
            event_type,
            endpoint,
        })
        .collect();
    let services = diff(&old.services, &new.services, |e: &Service| e.id())
        .into_iter()
        .map(|(event_type, service)| ServiceEvent {
            event_type,
            service,
        })
        .collect();
    (endpoints, services)
}

fn diff<T, K>(old: &[T], new: &[T], key: K) -> Vec<(EventType, T)>
where
    T: Clone + Serialize,
    K: Fn(&T) -> String,
{
    let old: HashMap<String, &T> = old.iter().map(|e| (key(e), e)).collect();
    let mut seen = HashMap::new();
    let mut events = vec![];
    for item in new {
        let item_key = key(item);
        match old.get(&item_key) {
            None => events.push((EventType::Added, item.clone())),
            Some(previous) if !same_value(*previous, item) => {
                events.push((EventType::Updated, item.clone()))
            }
            Some(_) => {}
        }
        seen.insert(item_key, ());
    }
    for (old_key, item) in old {
        if !seen.contains_key(&old_key) {
            events.push((EventType::Removed, item.clone()));
        }
    }
    events
}

fn same_value<T: Serialize>(left: &T, right: &T) -> bool {
    match (serde_json::to_value(left), serde_json::to_value(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn resource(value: serde_json::Value) -> DiscoveryResource {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_diff_resources() {
        let old = resource(json!({
            "endpoints": [
                {"version": "v1", "httpMethod": "GET", "httpPattern": "/a", "service": {"interface": "A", "method": "get"}},
                {"version": "v1", "httpMethod": "GET", "httpPattern": "/b", "service": {"interface": "B", "method": "get"}}
            ],
            "services": [{"interface": "A", "method": "get"}]
        }));
        let new = resource(json!({
            "endpoints": [
                {"version": "v1", "httpMethod": "GET", "httpPattern": "/a", "service": {"interface": "A", "method": "find"}},
                {"version": "v2", "httpMethod": "GET", "httpPattern": "/b", "service": {"interface": "B", "method": "get"}}
            ],
            "services": [{"interface": "A", "method": "get"}]
        }));
        let (endpoints, services) = diff_resources(&old, &new);
        let events: Vec<(EventType, String)> = endpoints
            .iter()
            .map(|e| (e.event_type, format!("{}@{}", e.endpoint.route_key(), e.endpoint.version)))
            .collect();
        assert_eq!(
            events,
            vec![
                (EventType::Updated, "GET#/a@v1".to_string()),
                (EventType::Added, "GET#/b@v2".to_string()),
                (EventType::Removed, "GET#/b@v1".to_string()),
            ]
        );
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn test_resource_discovery() {
        let discovery = ResourceDiscovery::new(vec![]).with_resources(resource(json!({
            "endpoints": [{"version": "v1", "httpMethod": "GET", "httpPattern": "/a", "service": {"serviceId": "A:get"}}],
            "services": [{"interface": "A", "method": "get", "protocol": "ECHO"}]
        })));
        let (endpoint_sender, mut endpoint_receiver) = mpsc::unbounded_channel();
        let (service_sender, mut service_receiver) = mpsc::unbounded_channel();
        discovery.watch(endpoint_sender, service_sender).await.unwrap();
        let service = service_receiver.recv().await.unwrap();
        assert_eq!(service.event_type, EventType::Added);
        assert_eq!(service.service.id(), "A:get");
        let endpoint = endpoint_receiver.recv().await.unwrap();
        assert_eq!(endpoint.endpoint.route_key(), "GET#/a");
        assert!(endpoint_receiver.recv().await.is_none());
        assert!(service_receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let discovery = ResourceDiscovery::new(vec!["./not-exists.yaml".to_string()]);
        let (endpoint_sender, _endpoint_receiver) = mpsc::unbounded_channel();
        let (service_sender, _service_receiver) = mpsc::unbounded_channel();
        assert!(discovery.watch(endpoint_sender, service_sender).await.is_err());
    }
}
