use std::sync::Arc;

use fusen_gateway_common::{
    context::ContextPool,
    model::{argument::ValueResolver, service::PROTO_INAPP},
};
#[cfg(feature = "nacos")]
use fusen_gateway_register::support::nacos::NacosDiscovery;
use fusen_gateway_register::{support::resource::ResourceDiscovery, Discovery};
use tokio::sync::{broadcast, mpsc, mpsc::unbounded_channel};
use tracing::info;

use crate::{
    config::GatewayConfig,
    discovery::DiscoveryEventLoop,
    endpoint::{service::ServiceRegistry, EndpointRegistry},
    error::GatewayError,
    filter::{
        hystrix::{HystrixFilter, HystrixFilterSelector},
        jwt::{JwtFilter, JwtFilterSelector},
        permission::{PermissionFilter, PermissionFilterSelector},
        ratelimit::{RateLimitFilter, RateLimitFilterSelector},
        trace::TraceFilter,
        Filter, FilterChain, FilterSelector,
    },
    resolve::{value::ValueResolverRegistry, ArgumentResolver},
    router::{EndpointSelector, Router},
    server::{handler::GatewayHandler, GatewayServer, RouteTable},
    transporter::{
        inapp::{InAppInvoker, InAppTransporter},
        Transporter, TransporterRegistry,
    },
};

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod lookup;
pub mod resolve;
pub mod router;
pub mod server;
pub mod transporter;

#[derive(Default)]
pub struct GatewayApplicationBuilder {
    config: GatewayConfig,
    transporters: Vec<(String, Arc<dyn Transporter>)>,
    value_resolvers: Vec<(String, ValueResolver)>,
    filters: Vec<Arc<dyn Filter>>,
    filter_selectors: Vec<Arc<dyn FilterSelector>>,
    endpoint_selectors: Vec<Arc<dyn EndpointSelector>>,
    discoveries: Vec<Arc<dyn Discovery>>,
    invokers: Vec<(String, Arc<dyn InAppInvoker>)>,
}

impl GatewayApplicationBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the built-in transporter of the same protocol, if any.
    pub fn transporter(mut self, protocol: &str, transporter: Arc<dyn Transporter>) -> Self {
        self.transporters.push((protocol.to_owned(), transporter));
        self
    }

    pub fn value_resolver(mut self, class_name: &str, resolver: ValueResolver) -> Self {
        self.value_resolvers.push((class_name.to_owned(), resolver));
        self
    }

    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filter_selector(mut self, selector: Arc<dyn FilterSelector>) -> Self {
        self.filter_selectors.push(selector);
        self
    }

    pub fn endpoint_selector(mut self, selector: Arc<dyn EndpointSelector>) -> Self {
        self.endpoint_selectors.push(selector);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discoveries.push(discovery);
        self
    }

    /// Registers an in-process service of the `INAPP` protocol.
    pub fn inapp_invoker(mut self, service_id: &str, invoker: Arc<dyn InAppInvoker>) -> Self {
        self.invokers.push((service_id.to_owned(), invoker));
        self
    }

    pub fn build(self) -> Result<GatewayApplication, GatewayError> {
        let mut resolvers = ValueResolverRegistry::default();
        for (class_name, resolver) in self.value_resolvers {
            resolvers.register(&class_name, resolver);
        }
        let resolver = ArgumentResolver::new(Arc::new(resolvers));

        let mut transporters =
            TransporterRegistry::with_defaults(resolver.clone(), &self.config.transporter);
        let inapp = InAppTransporter::new(resolver.clone());
        for (service_id, invoker) in self.invokers {
            inapp.register_invoker(&service_id, invoker);
        }
        transporters.register_transporter(PROTO_INAPP, Arc::new(inapp));
        for (protocol, transporter) in self.transporters {
            transporters.register_transporter(&protocol, transporter);
        }
        let transporters = Arc::new(transporters);
        info!(protocols = ?transporters.protocols(), "transporters registered");

        let endpoints = Arc::new(EndpointRegistry::default());
        let services = Arc::new(ServiceRegistry::default());
        let permission = Arc::new(PermissionFilter::new(transporters.clone(), services.clone()));
        let mut chain = FilterChain::new(self.filters, self.filter_selectors);
        chain.add_filter(Arc::new(TraceFilter::default()));
        chain.add_selector(Arc::new(PermissionFilterSelector::new(permission)));
        if let Some(jwt) = &self.config.filter.jwt {
            let filter = Arc::new(JwtFilter::new(jwt)?);
            chain.add_selector(Arc::new(JwtFilterSelector::new(filter)));
        }
        if let Some(rate_limit) = &self.config.filter.rate_limit {
            let filter = Arc::new(RateLimitFilter::new(rate_limit));
            chain.add_selector(Arc::new(RateLimitFilterSelector::new(filter)));
        }
        if let Some(hystrix) = &self.config.filter.hystrix {
            let filter = Arc::new(HystrixFilter::new(hystrix));
            chain.add_selector(Arc::new(HystrixFilterSelector::new(filter)));
        }

        let mut router =
            Router::new(transporters, chain).with_version_header(&self.config.version_header);
        for selector in self.endpoint_selectors {
            router.add_selector(selector);
        }
        let routes = Arc::new(RouteTable::default());
        let handler = Arc::new(GatewayHandler::new(
            router,
            endpoints.clone(),
            routes.clone(),
            ContextPool::new(self.config.context_pool_size),
        ));

        let mut discoveries = self.discoveries;
        if let Some(resource) = &self.config.discovery.resource {
            discoveries.push(Arc::new(ResourceDiscovery::new(resource.paths.clone())));
        }
        #[cfg(feature = "nacos")]
        if let Some(nacos) = &self.config.discovery.nacos {
            discoveries.push(Arc::new(NacosDiscovery::init(nacos.clone())?));
        }
        Ok(GatewayApplication {
            config: self.config,
            endpoints,
            services,
            resolver,
            routes,
            handler,
            discoveries,
        })
    }
}

pub struct GatewayApplication {
    config: GatewayConfig,
    endpoints: Arc<EndpointRegistry>,
    services: Arc<ServiceRegistry>,
    resolver: ArgumentResolver,
    routes: Arc<RouteTable>,
    handler: Arc<GatewayHandler>,
    discoveries: Vec<Arc<dyn Discovery>>,
}

impl GatewayApplication {
    pub fn builder() -> GatewayApplicationBuilder {
        GatewayApplicationBuilder::default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn handler(&self) -> &Arc<GatewayHandler> {
        &self.handler
    }

    /// Starts the discovery event loop, every discovery watch and the listeners.
    pub async fn start(
        &self,
        notify_shutdown: &broadcast::Sender<()>,
    ) -> Result<mpsc::Receiver<()>, GatewayError> {
        let (endpoint_tx, endpoint_rx) = unbounded_channel();
        let (service_tx, service_rx) = unbounded_channel();
        let event_loop = DiscoveryEventLoop::new(
            self.endpoints.clone(),
            self.services.clone(),
            self.resolver.clone(),
            self.routes.clone(),
        );
        tokio::spawn(event_loop.run(endpoint_rx, service_rx));
        for discovery in &self.discoveries {
            info!(discovery = discovery.id(), "discovery watch start");
            discovery
                .watch(endpoint_tx.clone(), service_tx.clone())
                .await?;
        }
        drop(endpoint_tx);
        drop(service_tx);
        let server = GatewayServer::bind(&self.config.listeners, self.handler.clone()).await?;
        Ok(server.run(notify_shutdown))
    }

    /// Serves until ctrl-c, then waits for open connections to finish.
    pub async fn run(self) -> Result<(), GatewayError> {
        let notify_shutdown = broadcast::channel(1).0;
        let mut shutdown_complete = self.start(&notify_shutdown).await?;
        info!(application = %self.config.application_name, "gateway started");
        tokio::signal::ctrl_c().await?;
        info!("gateway shutdown");
        let _ = notify_shutdown.send(());
        drop(notify_shutdown);
        let _ = shutdown_complete.recv().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fusen_gateway_common::{
        context::{CancelSignal, Context, WebRequest},
        error::ServeError,
        model::{Endpoint, Service},
        BoxFutureV2,
    };
    use fusen_gateway_register::support::resource::DiscoveryResource;
    use http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};

    use super::*;
    use crate::config::{HystrixFilterConfig, JwtFilterConfig, ListenerConfig};

    struct Greeter;

    impl InAppInvoker for Greeter {
        fn invoke<'a>(
            &'a self,
            ctx: &'a Context,
            _service: &'a Service,
        ) -> BoxFutureV2<'a, Result<Value, ServeError>> {
            Box::pin(async move {
                let name = ctx.request().path_values.get("name").cloned();
                Ok(json!({ "hello": name }))
            })
        }
    }

    #[tokio::test]
    async fn test_application() {
        let resources = DiscoveryResource {
            endpoints: vec![Endpoint {
                version: "v1".to_owned(),
                http_method: "GET".to_owned(),
                http_pattern: "/hello/{name}".to_owned(),
                service: Service {
                    service_id: "demo.Greeter:hello".to_owned(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            services: vec![Service {
                protocol: "INAPP".to_owned(),
                interface: "demo.Greeter".to_owned(),
                method: "hello".to_owned(),
                ..Default::default()
            }],
        };
        let config = GatewayConfig {
            listeners: vec![ListenerConfig {
                address: "127.0.0.1".to_owned(),
                port: 0,
                ..Default::default()
            }],
            ..Default::default()
        };
        let application = GatewayApplication::builder()
            .config(config)
            .discovery(Arc::new(
                ResourceDiscovery::new(vec![]).with_resources(resources),
            ))
            .inapp_invoker("demo.Greeter:hello", Arc::new(Greeter))
            .build()
            .unwrap();
        let notify_shutdown = broadcast::channel(1).0;
        let mut shutdown_complete = application.start(&notify_shutdown).await.unwrap();

        let mut response = None;
        for _ in 0..50 {
            let routed = application
                .handler()
                .handle(
                    "default",
                    WebRequest::new("GET", "/hello/bob"),
                    CancelSignal::never(),
                )
                .await;
            if routed.status() == StatusCode::OK {
                response = Some(routed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let body = response.unwrap().into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"hello": "bob"}));
        assert!(application
            .services()
            .lookup_service_by_id("demo.Greeter:hello")
            .is_some());

        notify_shutdown.send(()).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), shutdown_complete.recv()).await;
        assert_eq!(closed.ok(), Some(None));
    }

    #[tokio::test]
    async fn test_filter_config() {
        let mut config = GatewayConfig::default();
        config.filter.hystrix = Some(HystrixFilterConfig::default());
        assert!(GatewayApplication::builder().config(config.clone()).build().is_ok());

        config.filter.jwt = Some(JwtFilterConfig::default());
        let built = GatewayApplication::builder().config(config).build();
        assert!(matches!(built, Err(GatewayError::Config(_))));
    }
}
