use std::time::Duration;

use bytes::Bytes;
use http::{
    header::{
        CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING,
        UPGRADE,
    },
    response, HeaderMap, HeaderName, Request, Response,
};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use thiserror::Error;

use crate::config::UpstreamClientConfig;

type UpstreamPool = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProtocol {
    Http1,
    /// Prior-knowledge h2, used by Triple.
    Http2,
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream timeout after {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("upstream body read failed: {0}")]
    Body(#[from] hyper::Error),
}

/// An upstream response read to the end, trailers kept apart.
#[derive(Debug)]
pub struct Exchange {
    pub parts: response::Parts,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

impl Exchange {
    pub fn into_response(self) -> Response<Bytes> {
        Response::from_parts(self.parts, self.body)
    }
}

/// Connection pools towards upstreams, one per wire protocol.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http1: UpstreamPool,
    http2: UpstreamPool,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(&UpstreamClientConfig::default())
    }
}

impl UpstreamClient {
    pub fn new(config: &UpstreamClientConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(config.keepalive()));
        connector.set_connect_timeout(Some(config.connect_timeout()));
        connector.set_nodelay(true);
        connector.enforce_http(false);
        let pool = |http2_only: bool| {
            Client::builder(TokioExecutor::new())
                .pool_timer(TokioTimer::new())
                .pool_idle_timeout(config.idle_timeout())
                .pool_max_idle_per_host(config.max_idle_per_host)
                .http2_only(http2_only)
                .build(HttpsConnector::new_with_connector(connector.clone()))
        };
        Self {
            http1: pool(false),
            http2: pool(true),
        }
    }

    /// Sends the request and reads the whole response within `timeout`.
    /// Hop-by-hop headers are dropped on the way out and on the way back.
    pub async fn exchange(
        &self,
        protocol: UpstreamProtocol,
        mut request: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Exchange, UpstreamError> {
        remove_hop_headers(request.headers_mut());
        let pool = match protocol {
            UpstreamProtocol::Http1 => &self.http1,
            UpstreamProtocol::Http2 => &self.http2,
        };
        let exchange = async {
            let (mut parts, body) = pool.request(request).await?.into_parts();
            let collected = body.collect().await?;
            let trailers = collected.trailers().cloned();
            remove_hop_headers(&mut parts.headers);
            Ok::<_, UpstreamError>(Exchange {
                parts,
                body: collected.to_bytes(),
                trailers,
            })
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout(timeout))?
    }
}

pub fn is_hop_header(name: &HeaderName) -> bool {
    [
        CONNECTION,
        KEEP_ALIVE,
        PROXY_CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ]
    .contains(name)
}

/// Drops hop-by-hop headers, including the ones named by `Connection`.
/// `te: trailers` survives since h2 upstreams require it.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|e| e.to_str().ok())
        .flat_map(|e| e.split(','))
        .filter_map(|e| HeaderName::from_bytes(e.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    let te_trailers = headers
        .get(TE)
        .and_then(|e| e.to_str().ok())
        .is_some_and(|e| e.trim().eq_ignore_ascii_case("trailers"));
    let hop: Vec<HeaderName> = headers.keys().filter(|e| is_hop_header(e)).cloned().collect();
    for name in hop {
        if name == TE && te_trailers {
            continue;
        }
        headers.remove(name);
    }
}
