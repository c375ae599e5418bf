use std::sync::Arc;

use fusen_gateway_common::{
    model::{endpoint::is_allowed_method, Endpoint, Service},
    BoxFutureV2,
};
use fusen_gateway_register::{EndpointEvent, EventType, ServiceEvent};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::{
    endpoint::{service::ServiceRegistry, EndpointRegistry},
    resolve::ArgumentResolver,
};

/// Receives route keys the first time they are registered.
pub trait RouteBinder: Send + Sync {
    fn bind_route<'a>(&'a self, listener_id: &'a str, route_key: &'a str) -> BoxFutureV2<'a, ()>;
}

/// Applies discovery events to the registries, one event at a time.
pub struct DiscoveryEventLoop {
    endpoints: Arc<EndpointRegistry>,
    services: Arc<ServiceRegistry>,
    resolver: ArgumentResolver,
    binder: Arc<dyn RouteBinder>,
}

impl DiscoveryEventLoop {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        services: Arc<ServiceRegistry>,
        resolver: ArgumentResolver,
        binder: Arc<dyn RouteBinder>,
    ) -> Self {
        Self {
            endpoints,
            services,
            resolver,
            binder,
        }
    }

    /// Runs until both producers have dropped their senders.
    pub async fn run(
        self,
        mut endpoint_events: UnboundedReceiver<EndpointEvent>,
        mut service_events: UnboundedReceiver<ServiceEvent>,
    ) {
        let mut endpoints_open = true;
        let mut services_open = true;
        while endpoints_open || services_open {
            tokio::select! {
                event = endpoint_events.recv(), if endpoints_open => match event {
                    Some(event) => self.on_endpoint_event(event).await,
                    None => endpoints_open = false,
                },
                event = service_events.recv(), if services_open => match event {
                    Some(event) => self.on_service_event(event),
                    None => services_open = false,
                },
            }
        }
        info!("discovery event loop closed");
    }

    async fn on_endpoint_event(&self, event: EndpointEvent) {
        let mut endpoint = event.endpoint;
        if !is_allowed_method(&endpoint.http_method) {
            warn!(
                method = %endpoint.http_method,
                pattern = %endpoint.http_pattern,
                "endpoint method not allowed, event ignored"
            );
            return;
        }
        endpoint.http_method = endpoint.http_method.to_uppercase();
        let route_key = endpoint.route_key();
        match event.event_type {
            EventType::Added | EventType::Updated => {
                self.sync_service(&mut endpoint);
                if !endpoint.is_valid() {
                    warn!(%route_key, version = %endpoint.version, "invalid endpoint, event ignored");
                    return;
                }
                self.resolver.bind_service(&mut endpoint.service);
                if let Some(permission) = endpoint.permission.as_mut() {
                    self.resolver.bind_service(permission);
                }
                let listener_id = endpoint.listener_id();
                let version = endpoint.version.clone();
                let (_, created) = self
                    .endpoints
                    .register_endpoint(&route_key, Arc::new(endpoint));
                debug!(%route_key, %version, event = ?event.event_type, "endpoint registered");
                if created {
                    self.binder.bind_route(&listener_id, &route_key).await;
                }
            }
            EventType::Removed => {
                if let Some(multi) = self.endpoints.endpoint_by_key(&route_key) {
                    multi.delete(&endpoint.version);
                    debug!(%route_key, version = %endpoint.version, "endpoint removed");
                }
            }
        }
    }

    fn on_service_event(&self, event: ServiceEvent) {
        match event.event_type {
            EventType::Added | EventType::Updated => {
                let mut service = event.service;
                self.resolver.bind_service(&mut service);
                let service = Arc::new(service);
                self.services.register_service(service.clone());
                debug!(service = %service.id(), event = ?event.event_type, "service registered");
                self.sync_endpoints(&service);
            }
            EventType::Removed => {
                self.services.remove_service(&event.service);
                debug!(service = %event.service.id(), "service removed");
            }
        }
    }

    /// Binds the registered service an endpoint refers to by id.
    fn sync_service(&self, endpoint: &mut Endpoint) {
        let service_id = &endpoint.service.service_id;
        if service_id.is_empty() || endpoint.is_static_model() {
            return;
        }
        if let Some(service) = self.services.lookup_service_by_id(service_id) {
            endpoint.service = bound_service(&service, service_id);
        }
    }

    /// Swaps in new endpoint values for every version referring to `service`.
    fn sync_endpoints(&self, service: &Service) {
        let id = service.id();
        let refers = |service_id: &str| {
            !service_id.is_empty()
                && (service_id == id || (service_id == service.alias_id && !service.alias_id.is_empty()))
        };
        for (route_key, multi) in self.endpoints.multi_endpoints() {
            for (version, endpoint) in multi.endpoints() {
                if endpoint.is_static_model() || !refers(&endpoint.service.service_id) {
                    continue;
                }
                let mut synced = endpoint.as_ref().clone();
                synced.service = bound_service(service, &endpoint.service.service_id);
                multi.update(&version, Arc::new(synced));
                debug!(%route_key, %version, service = %id, "endpoint service synced");
            }
        }
    }
}

/// Keeps the referring id so later service events still match.
fn bound_service(service: &Service, service_id: &str) -> Service {
    let mut service = service.clone();
    service_id.clone_into(&mut service.service_id);
    service
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fusen_gateway_common::model::endpoint::ATTR_TAG_STATIC_MODEL;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    #[derive(Default)]
    struct RecordBinder {
        routes: Mutex<Vec<(String, String)>>,
    }

    impl RouteBinder for RecordBinder {
        fn bind_route<'a>(
            &'a self,
            listener_id: &'a str,
            route_key: &'a str,
        ) -> BoxFutureV2<'a, ()> {
            Box::pin(async move {
                self.routes
                    .lock()
                    .unwrap()
                    .push((listener_id.to_owned(), route_key.to_owned()));
            })
        }
    }

    fn event_loop() -> (DiscoveryEventLoop, Arc<RecordBinder>) {
        let binder = Arc::new(RecordBinder::default());
        let event_loop = DiscoveryEventLoop::new(
            Arc::new(EndpointRegistry::default()),
            Arc::new(ServiceRegistry::default()),
            ArgumentResolver::default(),
            binder.clone(),
        );
        (event_loop, binder)
    }

    fn endpoint(method: &str, version: &str, service: Service) -> Endpoint {
        Endpoint {
            version: version.to_owned(),
            http_method: method.to_owned(),
            http_pattern: "/users/{id}".to_owned(),
            service,
            ..Default::default()
        }
    }

    fn by_id(service_id: &str) -> Service {
        Service {
            service_id: service_id.to_owned(),
            ..Default::default()
        }
    }

    fn user_service(method: &str) -> Service {
        Service {
            protocol: "HTTP".to_owned(),
            interface: "net.demo.UserService".to_owned(),
            method: method.to_owned(),
            ..Default::default()
        }
    }

    fn added(endpoint: Endpoint) -> EndpointEvent {
        EndpointEvent {
            event_type: EventType::Added,
            endpoint,
        }
    }

    #[tokio::test]
    async fn test_route_bound_once() {
        let (event_loop, binder) = event_loop();
        event_loop
            .on_endpoint_event(added(endpoint("get", "v1", user_service("find"))))
            .await;
        event_loop
            .on_endpoint_event(added(endpoint("GET", "v2", user_service("find"))))
            .await;
        let multi = event_loop.endpoints.endpoint_by_key("GET#/users/{id}").unwrap();
        assert_eq!(multi.len(), 2);
        assert_eq!(
            *binder.routes.lock().unwrap(),
            vec![("default".to_owned(), "GET#/users/{id}".to_owned())]
        );

        event_loop
            .on_endpoint_event(EndpointEvent {
                event_type: EventType::Removed,
                endpoint: endpoint("GET", "v1", Service::default()),
            })
            .await;
        assert!(multi.lookup_by_version("v1").is_none());
        assert!(multi.lookup_by_version("v2").is_some());
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (event_loop, binder) = event_loop();
        event_loop
            .on_endpoint_event(added(endpoint("CONNECT", "v1", user_service("find"))))
            .await;
        assert!(event_loop.endpoints.multi_endpoints().is_empty());
        assert!(binder.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_service_and_endpoints() {
        let (event_loop, _) = event_loop();
        let mut static_model = endpoint("GET", "v2", by_id("user.find"));
        static_model
            .attributes
            .insert(ATTR_TAG_STATIC_MODEL.to_owned(), json!(true));
        event_loop
            .on_endpoint_event(added(endpoint("GET", "v1", by_id("user.find"))))
            .await;
        event_loop.on_endpoint_event(added(static_model)).await;

        let mut service = user_service("findById");
        service.alias_id = "user.find".to_owned();
        event_loop.on_service_event(ServiceEvent {
            event_type: EventType::Added,
            service: service.clone(),
        });
        let multi = event_loop.endpoints.endpoint_by_key("GET#/users/{id}").unwrap();
        let synced = multi.lookup_by_version("v1").unwrap();
        assert_eq!(synced.service.method, "findById");
        assert_eq!(synced.service.service_id, "user.find");
        assert!(multi.lookup_by_version("v2").unwrap().service.method.is_empty());

        service.method = "findByUid".to_owned();
        event_loop.on_service_event(ServiceEvent {
            event_type: EventType::Updated,
            service: service.clone(),
        });
        assert_eq!(
            multi.lookup_by_version("v1").unwrap().service.method,
            "findByUid"
        );

        event_loop
            .on_endpoint_event(added(endpoint("GET", "v3", by_id("user.find"))))
            .await;
        assert_eq!(
            multi.lookup_by_version("v3").unwrap().service.method,
            "findByUid"
        );

        event_loop.on_service_event(ServiceEvent {
            event_type: EventType::Removed,
            service,
        });
        assert!(event_loop.services.lookup_service_by_id("user.find").is_none());
    }

    #[tokio::test]
    async fn test_run_until_closed() {
        let (event_loop, binder) = event_loop();
        let endpoints = event_loop.endpoints.clone();
        let (endpoint_tx, endpoint_rx) = unbounded_channel();
        let (service_tx, service_rx) = unbounded_channel();
        let running = tokio::spawn(event_loop.run(endpoint_rx, service_rx));
        endpoint_tx
            .send(added(endpoint("POST", "v1", user_service("save"))))
            .unwrap();
        service_tx
            .send(ServiceEvent {
                event_type: EventType::Added,
                service: user_service("save"),
            })
            .unwrap();
        drop(endpoint_tx);
        drop(service_tx);
        running.await.unwrap();
        assert!(endpoints.endpoint_by_key("POST#/users/{id}").is_some());
        assert_eq!(binder.routes.lock().unwrap().len(), 1);
    }
}
