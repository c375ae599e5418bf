use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use fusen_gateway_common::{
    context::Context,
    error::{BoxError, ErrorCode, ServeError},
    model::Service,
    response::{ResponseBody, ServeResponse},
    url::encode_url_values,
    BoxFutureV2,
};
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT},
    HeaderMap, HeaderValue, Method, Request, Response,
};
use http_body_util::Full;
use serde_json::Value;
use tracing::debug;

use super::{
    client::{is_hop_header, UpstreamClient, UpstreamError, UpstreamProtocol},
    insert_headers, trace_context_headers, Transporter, TransporterCodec,
};
use crate::{config::HttpTransporterConfig, resolve::ArgumentResolver};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Forwards requests to HTTP upstreams.
pub struct HttpTransporter {
    client: Arc<UpstreamClient>,
    resolver: ArgumentResolver,
    default_timeout: Duration,
    user_agent: String,
    codec: TransporterCodec<Response<Bytes>>,
}

impl HttpTransporter {
    pub fn new(
        client: Arc<UpstreamClient>,
        resolver: ArgumentResolver,
        config: &HttpTransporterConfig,
    ) -> Self {
        Self {
            client,
            resolver,
            default_timeout: config.timeout(),
            user_agent: config.user_agent.clone(),
            codec: Arc::new(http_codec),
        }
    }

    pub fn with_codec(mut self, codec: TransporterCodec<Response<Bytes>>) -> Self {
        self.codec = codec;
        self
    }

    fn assemble(&self, ctx: &Context, service: &Service) -> Result<Request<Full<Bytes>>, ServeError> {
        let request = ctx.request();
        let url = if service.url.is_empty() {
            &service.interface
        } else {
            &service.url
        };
        if url.is_empty() {
            return Err(ServeError::new(
                ErrorCode::RequestAssembleFailed,
                format!("upstream url is empty, service: {}", service.id()),
            ));
        }
        let method = if service.method.is_empty() {
            request.method.as_str()
        } else {
            service.method.as_str()
        };
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|error| ServeError::assemble(format!("illegal http method: {method}"), error))?;

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 4);
        for (name, value) in &request.headers {
            if name != HOST && name != CONTENT_LENGTH && !is_hop_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        let attributes: Vec<(&str, String)> = ctx
            .attributes()
            .iter()
            .filter(|(name, _)| !name.contains('@') && !name.contains(':'))
            .filter_map(|(name, value)| match value {
                Value::Null => None,
                Value::String(value) => Some((name.as_str(), value.clone())),
                other => Some((name.as_str(), other.to_string())),
            })
            .collect();
        insert_headers(
            &mut headers,
            attributes.iter().map(|(name, value)| (*name, value.as_str())),
        );
        let trace_headers = trace_context_headers();
        insert_headers(
            &mut headers,
            trace_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if let Ok(user_agent) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, user_agent);
        }

        let (query, body) = if service.arguments.is_empty() {
            (request.raw_query().to_owned(), request.body.clone())
        } else {
            let mut pairs = Vec::with_capacity(service.arguments.len());
            for argument in &service.arguments {
                let value = self.resolver.resolve(ctx, argument)?;
                push_pairs(&mut pairs, &argument.name, value);
            }
            let encoded = encode_url_values(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            if method == Method::GET {
                (encoded, Bytes::new())
            } else {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                (String::new(), Bytes::from(encoded))
            }
        };
        let uri = match (query.is_empty(), url.contains('?')) {
            (true, _) => url.to_owned(),
            (false, true) => format!("{url}&{query}"),
            (false, false) => format!("{url}?{query}"),
        };

        let mut builder = Request::builder().method(method).uri(&uri);
        if let Some(request_headers) = builder.headers_mut() {
            *request_headers = headers;
        }
        builder
            .body(Full::new(body))
            .map_err(|error| ServeError::assemble(format!("illegal upstream request: {uri}"), error))
    }
}

fn push_pairs(pairs: &mut Vec<(String, String)>, name: &str, value: Value) {
    match value {
        Value::Null => pairs.push((name.to_owned(), String::new())),
        Value::String(value) => pairs.push((name.to_owned(), value)),
        Value::Array(values) => {
            for value in values {
                push_pairs(pairs, name, value);
            }
        }
        other => pairs.push((name.to_owned(), other.to_string())),
    }
}

/// Json upstream bodies are parsed, anything else is passed through as bytes.
pub fn http_codec(response: Response<Bytes>) -> Result<ServeResponse, BoxError> {
    let (parts, body) = response.into_parts();
    let is_json = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|e| e.to_str().ok())
        .is_some_and(|e| e.contains("json"));
    let body = if body.is_empty() {
        ResponseBody::Empty
    } else if is_json {
        ResponseBody::Value(serde_json::from_slice(&body)?)
    } else {
        ResponseBody::Bytes(body)
    };
    Ok(ServeResponse::new(parts.status.as_u16(), body).with_headers(parts.headers))
}

impl Transporter for HttpTransporter {
    fn do_invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<ServeResponse, ServeError>> {
        Box::pin(async move {
            let request = self.assemble(ctx, service)?;
            let timeout = ctx.child_timeout(service.rpc_timeout().unwrap_or(self.default_timeout));
            debug!(uri = %request.uri(), ?timeout, "http transporter invoke");
            let response = self
                .client
                .exchange(UpstreamProtocol::Http1, request, timeout)
                .await
                .map_err(|error| match error {
                    UpstreamError::Timeout(_) => {
                        ServeError::new(ErrorCode::BackendTimeout, format!("http {error}"))
                    }
                    error => ServeError::remote("http upstream exchange failed", error),
                })?
                .into_response();
            (self.codec)(response)
                .map_err(|error| ServeError::decode("http response decode failed", error))
        })
    }
}
