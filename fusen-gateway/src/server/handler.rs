use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use fusen_gateway_common::{
    context::{cancel_pair, CancelSignal, ContextPool, WebRequest},
    error::ServeError,
    response::{ResponseBody, ServeResponse},
    BoxFuture,
};
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, HOST},
    HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode,
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::Service};
use tracing::debug;

use super::RouteTable;
use crate::{endpoint::EndpointRegistry, router::Router, transporter::client::is_hop_header};

const APPLICATION_JSON: &str = "application/json";
const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Matches inbound requests to route keys and writes the routed result.
pub struct GatewayHandler {
    router: Router,
    endpoints: Arc<EndpointRegistry>,
    routes: Arc<RouteTable>,
    contexts: ContextPool,
}

impl GatewayHandler {
    pub fn new(
        router: Router,
        endpoints: Arc<EndpointRegistry>,
        routes: Arc<RouteTable>,
        contexts: ContextPool,
    ) -> Self {
        Self {
            router,
            endpoints,
            routes,
            contexts,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn handle(
        &self,
        listener_id: &str,
        mut request: WebRequest,
        cancel: CancelSignal,
    ) -> Response<Full<Bytes>> {
        let matched = self
            .routes
            .path_cache(listener_id)
            .search(&request.method, request.path())
            .await
            .and_then(|matched| {
                self.endpoints
                    .endpoint_by_key(&matched.route_key)
                    .map(|multi| (matched, multi))
            });
        let Some((matched, multi)) = matched else {
            debug!(listener_id, method = %request.method, uri = %request.uri, "path not matched");
            let error = ServeError::route_not_found(format!(
                "route not found: {} {}",
                request.method,
                request.path()
            ));
            return error_response(None, &error);
        };
        request.path_values.extend(matched.path_values);
        let mut ctx = self.contexts.acquire(request, cancel);
        let response = match self.router.route(&mut ctx, listener_id, &multi).await {
            Ok(response) => write_response(ctx.request_id(), response),
            Err(error) => error_response(Some(ctx.request_id()), &error),
        };
        self.contexts.release(ctx);
        response
    }
}

/// Per-connection hyper service of one listener.
#[derive(Clone)]
pub struct GatewayService {
    listener_id: Arc<str>,
    remote_addr: SocketAddr,
    handler: Arc<GatewayHandler>,
}

impl GatewayService {
    pub fn new(listener_id: Arc<str>, remote_addr: SocketAddr, handler: Arc<GatewayHandler>) -> Self {
        Self {
            listener_id,
            remote_addr,
            handler,
        }
    }

    async fn web_request(&self, request: Request<Incoming>) -> Result<WebRequest, ServeError> {
        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|error| {
                ServeError::internal("read request body failed")
                    .with_status(400)
                    .with_cause(error)
            })?
            .to_bytes();
        let uri = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_owned(), |e| e.as_str().to_owned());
        let host = parts
            .headers
            .get(HOST)
            .and_then(|e| e.to_str().ok())
            .or(parts.uri.host())
            .unwrap_or_default()
            .to_owned();
        let mut request = WebRequest::new(parts.method.as_str(), &uri);
        request.headers = parts.headers;
        Ok(request
            .with_host(&host)
            .with_remote_addr(&self.remote_addr.to_string())
            .with_body(body))
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            // dropped with the connection future, which cancels the request
            let (handle, cancel) = cancel_pair();
            let _cancel_guard = handle.drop_guard();
            let request = match service.web_request(request).await {
                Ok(request) => request,
                Err(error) => return Ok(error_response(None, &error)),
            };
            Ok(service
                .handler
                .handle(&service.listener_id, request, cancel)
                .await)
        })
    }
}

fn status(status_code: u16) -> StatusCode {
    StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn copy_headers(target: &mut HeaderMap, source: &HeaderMap) {
    for (name, value) in source {
        if name == CONTENT_LENGTH || is_hop_header(name) {
            continue;
        }
        target.append(name.clone(), value.clone());
    }
}

fn set_request_id(headers: &mut HeaderMap, request_id: Option<&str>) {
    if let Some(Ok(value)) = request_id.map(HeaderValue::from_str) {
        headers.insert(REQUEST_ID, value);
    }
}

pub fn write_response(request_id: &str, response: ServeResponse) -> Response<Full<Bytes>> {
    let (content_type, body) = match response.body {
        ResponseBody::Empty => (None, Bytes::new()),
        ResponseBody::Bytes(bytes) => (None, bytes),
        ResponseBody::Value(value) => match serde_json::to_vec(&value) {
            Ok(body) => (Some(APPLICATION_JSON), Bytes::from(body)),
            Err(error) => {
                let error = ServeError::internal("encode response body failed").with_cause(error);
                return error_response(Some(request_id), &error);
            }
        },
    };
    let mut http_response = Response::new(Full::new(body));
    *http_response.status_mut() = status(response.status_code);
    let headers = http_response.headers_mut();
    copy_headers(headers, &response.headers);
    if let Some(content_type) = content_type {
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(content_type));
    }
    set_request_id(headers, Some(request_id));
    http_response
}

/// The json error envelope; the cause stays in the logs.
pub fn error_response(request_id: Option<&str>, error: &ServeError) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&error.to_body()).unwrap_or_default();
    let mut http_response = Response::new(Full::new(Bytes::from(body)));
    *http_response.status_mut() = status(error.status_code);
    let headers = http_response.headers_mut();
    copy_headers(headers, &error.headers);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    set_request_id(headers, request_id);
    http_response
}
