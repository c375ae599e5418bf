use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
};

use fusen_gateway_common::BoxFutureV2;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tracing::{debug, error, info};

use self::{
    handler::{GatewayHandler, GatewayService},
    path::PathCache,
    shutdown::Shutdown,
};
use crate::{config::ListenerConfig, discovery::RouteBinder, error::GatewayError};

pub mod handler;
pub mod path;
pub mod shutdown;

/// Path templates per listener id.
#[derive(Debug, Default)]
pub struct RouteTable {
    listeners: RwLock<HashMap<String, Arc<PathCache>>>,
}

impl RouteTable {
    pub fn path_cache(&self, listener_id: &str) -> Arc<PathCache> {
        if let Some(path_cache) = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(listener_id)
        {
            return path_cache.clone();
        }
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(listener_id.to_owned())
            .or_default()
            .clone()
    }
}

impl RouteBinder for RouteTable {
    fn bind_route<'a>(&'a self, listener_id: &'a str, route_key: &'a str) -> BoxFutureV2<'a, ()> {
        Box::pin(async move {
            self.path_cache(listener_id).insert(route_key).await;
            info!(listener_id, route_key, "route bound");
        })
    }
}

/// One hyper auto (HTTP/1 and HTTP/2) server per configured listener.
pub struct GatewayServer {
    listeners: Vec<(Arc<str>, TcpListener)>,
    handler: Arc<GatewayHandler>,
}

impl GatewayServer {
    pub async fn bind(
        configs: &[ListenerConfig],
        handler: Arc<GatewayHandler>,
    ) -> Result<Self, GatewayError> {
        let mut listeners = Vec::with_capacity(configs.len());
        for config in configs {
            let listener = TcpListener::bind((config.address.as_str(), config.port)).await?;
            info!(
                listener_id = %config.id,
                addr = ?listener.local_addr().ok(),
                "listener bound"
            );
            listeners.push((Arc::from(config.id.as_str()), listener));
        }
        Ok(Self {
            listeners,
            handler,
        })
    }

    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|(id, listener)| listener.local_addr().ok().map(|e| (id.to_string(), e)))
            .collect()
    }

    /// Serves every listener until `notify_shutdown` fires. The returned receiver
    /// yields `None` once all listeners and connections are closed.
    pub fn run(self, notify_shutdown: &broadcast::Sender<()>) -> mpsc::Receiver<()> {
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let builder = Arc::new(Builder::new(TokioExecutor::new()));
        for (listener_id, listener) in self.listeners {
            tokio::spawn(monitor(
                listener_id,
                listener,
                builder.clone(),
                self.handler.clone(),
                Shutdown::new(notify_shutdown.subscribe()),
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
            ));
        }
        drop(shutdown_complete_tx);
        shutdown_complete_rx
    }
}

async fn monitor(
    listener_id: Arc<str>,
    listener: TcpListener,
    builder: Arc<Builder<TokioExecutor>>,
    handler: Arc<GatewayHandler>,
    mut shutdown: Shutdown,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                info!(%listener_id, "listener shutdown");
                return;
            },
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp_stream, remote_addr)) => {
                debug!("socket stream connect, addr: {:?}", remote_addr);
                let stream_handler = StreamHandler {
                    builder: builder.clone(),
                    tcp_stream,
                    service: GatewayService::new(listener_id.clone(), remote_addr, handler.clone()),
                    shutdown: Shutdown::new(notify_shutdown.subscribe()),
                    _shutdown_complete: shutdown_complete_tx.clone(),
                };
                tokio::spawn(stream_handler.run_http());
            }
            Err(err) => error!("tcp connect, err: {:?}", err),
        }
    }
}

struct StreamHandler {
    builder: Arc<Builder<TokioExecutor>>,
    tcp_stream: TcpStream,
    service: GatewayService,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
}

impl StreamHandler {
    async fn run_http(mut self) {
        let conn = self
            .builder
            .serve_connection(TokioIo::new(self.tcp_stream), self.service);
        tokio::pin!(conn);
        let err_info = tokio::select! {
            res = conn.as_mut() => match res {
                Ok(_) => "client close".to_owned(),
                Err(err) => err.to_string(),
            },
            _ = self.shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                match conn.await {
                    Ok(_) => "server shutdown".to_owned(),
                    Err(err) => err.to_string(),
                }
            }
        };
        debug!("connect close by {}", err_info);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use fusen_gateway_common::{
        context::ContextPool,
        model::{Endpoint, Service},
    };
    use http::{Request, StatusCode};
    use http_body_util::Full;
    use serde_json::Value;

    use super::*;
    use crate::{
        endpoint::EndpointRegistry,
        filter::FilterChain,
        router::Router,
        transporter::{
            client::{UpstreamClient, UpstreamProtocol},
            echo::EchoTransporter,
            TransporterRegistry,
        },
    };

    #[tokio::test]
    async fn test_route_table() {
        let table = RouteTable::default();
        table.bind_route("web", "GET#/users/{id}").await;
        assert!(table.path_cache("web").search("GET", "/users/1").await.is_some());
        assert!(table.path_cache("default").search("GET", "/users/1").await.is_none());
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let mut transporters = TransporterRegistry::new();
        transporters.register_transporter("ECHO", Arc::new(EchoTransporter::new()));
        let endpoints = Arc::new(EndpointRegistry::default());
        let routes = Arc::new(RouteTable::default());
        let endpoint = Endpoint {
            version: "v1".to_owned(),
            http_method: "GET".to_owned(),
            http_pattern: "/echo/{name}".to_owned(),
            service: Service {
                protocol: "ECHO".to_owned(),
                interface: "echo".to_owned(),
                method: "get".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        endpoints.register_endpoint(&endpoint.route_key(), Arc::new(endpoint.clone()));
        routes.bind_route("default", &endpoint.route_key()).await;
        let handler = Arc::new(GatewayHandler::new(
            Router::new(Arc::new(transporters), FilterChain::default()),
            endpoints,
            routes,
            ContextPool::default(),
        ));
        let listener = ListenerConfig {
            address: "127.0.0.1".to_owned(),
            port: 0,
            ..Default::default()
        };
        let server = GatewayServer::bind(&[listener], handler).await.unwrap();
        let addr = server.local_addrs()[0].1;
        let notify_shutdown = broadcast::channel(1).0;
        let mut shutdown_complete = server.run(&notify_shutdown);

        let client = UpstreamClient::default();
        let request = Request::get(format!("http://{addr}/echo/alice"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let exchange = client
            .exchange(UpstreamProtocol::Http1, request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(exchange.parts.status, StatusCode::OK);
        assert!(exchange.parts.headers.contains_key("x-request-id"));
        let body = exchange.body;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["request-pathValues"]["name"], "alice");
        assert_eq!(body["request-headerValues"]["host"][0], addr.to_string());
        drop(client);

        notify_shutdown.send(()).unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), shutdown_complete.recv()).await;
        assert_eq!(closed.ok(), Some(None));
    }
}
