use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fusen_gateway_common::{error::BoxError, BoxFutureV2};
use http::{
    header::{CONTENT_TYPE, TE},
    HeaderMap, HeaderValue, Method, Request,
};
use http_body_util::Full;
use prost::Message;
use rand::Rng;
use serde_json::Value;

use super::{
    GenericRequest, GenericResult, GenericService, GenericServiceFactory, ReferenceConfig,
    ATTACHMENT_HTTP_HEADERS, ATTACHMENT_HTTP_STATUS,
};
use crate::transporter::{
    client::{UpstreamClient, UpstreamProtocol},
    insert_headers, trace_context_headers,
};

const GRPC_CONTENT_TYPE: &str = "application/grpc+proto";
const SERIALIZE_TYPE: &str = "fastjson";

/// Response header mapped onto [`ATTACHMENT_HTTP_STATUS`].
pub const HEADER_HTTP_STATUS: &str = "gateway-http-status";
/// Response header mapped onto [`ATTACHMENT_HTTP_HEADERS`].
pub const HEADER_HTTP_HEADERS: &str = "gateway-http-headers";

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TripleRequestWrapper {
    #[prost(string, tag = "1")]
    pub serialize_type: ::prost::alloc::string::String,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub args: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(string, repeated, tag = "3")]
    pub arg_types: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TripleResponseWrapper {
    #[prost(string, tag = "1")]
    pub serialize_type: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "3")]
    pub r#type: ::prost::alloc::string::String,
}

impl TripleRequestWrapper {
    pub fn get_buf(types: Vec<String>, values: &[Value]) -> Result<Bytes, BoxError> {
        let mut args = Vec::with_capacity(values.len());
        for value in values {
            args.push(serde_json::to_vec(value)?);
        }
        let trip = TripleRequestWrapper {
            serialize_type: SERIALIZE_TYPE.to_owned(),
            args,
            arg_types: types,
        };
        Ok(get_buf(trip.encode_to_vec()))
    }
}

impl TripleResponseWrapper {
    pub fn get_value(&self) -> Result<Value, BoxError> {
        if self.data.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Length-prefixed message frame: compression flag then a big-endian length.
fn get_buf(data: Vec<u8>) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 5);
    buf.put_u8(0);
    buf.put_u32(data.len() as u32);
    buf.put_slice(&data);
    buf.freeze()
}

fn read_frame(mut body: Bytes) -> Result<Bytes, BoxError> {
    if body.len() < 5 {
        return Err(format!("illegal triple frame, length: {}", body.len()).into());
    }
    if body.get_u8() != 0 {
        return Err("compressed triple frames are not supported".into());
    }
    let len = body.get_u32() as usize;
    if body.len() < len {
        return Err(format!("triple frame truncated, expect {len} got {}", body.len()).into());
    }
    Ok(body.split_to(len))
}

pub const LOAD_BALANCE_RANDOM: &str = "random";
pub const LOAD_BALANCE_ROUND_ROBIN: &str = "roundrobin";

/// Triple generic invocation over HTTP/2.
///
/// The reference url may list several providers separated by commas; each call
/// picks one by the configured load balance.
pub struct TripleGenericService {
    client: Arc<UpstreamClient>,
    config: ReferenceConfig,
    providers: Vec<String>,
    next: AtomicUsize,
}

impl TripleGenericService {
    pub fn new(client: Arc<UpstreamClient>, config: ReferenceConfig) -> Self {
        let providers = config
            .url
            .split(',')
            .map(|e| e.trim().trim_end_matches('/').to_owned())
            .filter(|e| !e.is_empty())
            .collect();
        Self {
            client,
            config,
            providers,
            next: AtomicUsize::new(0),
        }
    }

    fn select_provider(&self) -> Result<&str, BoxError> {
        let len = self.providers.len();
        if len == 0 {
            return Err(format!("no provider, interface: {}", self.config.interface).into());
        }
        let index = if self
            .config
            .load_balance
            .eq_ignore_ascii_case(LOAD_BALANCE_ROUND_ROBIN)
        {
            self.next.fetch_add(1, Ordering::Relaxed) % len
        } else {
            rand::thread_rng().gen_range(0..len)
        };
        Ok(&self.providers[index])
    }

    fn assemble(&self, request: &GenericRequest) -> Result<Request<Full<Bytes>>, BoxError> {
        let url = format!(
            "{}/{}/{}",
            self.select_provider()?,
            self.config.interface,
            request.method
        );
        let body = TripleRequestWrapper::get_buf(request.types.clone(), &request.values)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        headers.insert(TE, HeaderValue::from_static("trailers"));
        let timeout = format!("{}m", request.timeout.as_millis());
        insert_headers(
            &mut headers,
            [
                ("tri-service-version", self.config.version.as_str()),
                ("tri-service-group", self.config.group.as_str()),
                ("grpc-timeout", timeout.as_str()),
            ]
            .into_iter()
            .filter(|(_, value)| !value.is_empty()),
        );
        insert_headers(
            &mut headers,
            request
                .attachments
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        let trace_headers = trace_context_headers();
        insert_headers(
            &mut headers,
            trace_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        let mut builder = Request::builder().method(Method::POST).uri(url);
        if let Some(request_headers) = builder.headers_mut() {
            *request_headers = headers;
        }
        Ok(builder.body(Full::new(body))?)
    }
}

fn grpc_status(headers: &HeaderMap, trailers: Option<&HeaderMap>) -> Result<(), BoxError> {
    let find = |name: &str| {
        trailers
            .and_then(|e| e.get(name))
            .or_else(|| headers.get(name))
            .and_then(|e| e.to_str().ok())
    };
    match find("grpc-status") {
        None | Some("0") => Ok(()),
        Some(status) => {
            let message = find("grpc-message")
                .map(|e| urlencoding::decode(e).map_or(e.to_owned(), |e| e.into_owned()))
                .unwrap_or_default();
            Err(format!("triple invoke failed, grpc-status: {status}, message: {message}").into())
        }
    }
}

fn result_attachments(headers: &HeaderMap, trailers: Option<&HeaderMap>) -> HashMap<String, Value> {
    let mut attachments = HashMap::new();
    for (name, value) in headers.iter().chain(trailers.into_iter().flatten()) {
        let name = name.as_str();
        let Ok(value) = value.to_str() else {
            continue;
        };
        match name {
            HEADER_HTTP_STATUS => {
                attachments.insert(ATTACHMENT_HTTP_STATUS.to_owned(), Value::from(value));
            }
            HEADER_HTTP_HEADERS => {
                let headers = serde_json::from_str(value).unwrap_or(Value::Null);
                attachments.insert(ATTACHMENT_HTTP_HEADERS.to_owned(), headers);
            }
            "content-type" | "content-length" | "date" | "server" | "te" | "trailer" => {}
            name if name.starts_with("grpc-") || name.starts_with("tri-") => {}
            name => {
                attachments.insert(name.to_owned(), Value::from(value));
            }
        }
    }
    attachments
}

impl GenericService for TripleGenericService {
    fn invoke(&self, request: GenericRequest) -> BoxFutureV2<'_, Result<GenericResult, BoxError>> {
        Box::pin(async move {
            let timeout = request.timeout;
            let exchange = self
                .client
                .exchange(UpstreamProtocol::Http2, self.assemble(&request)?, timeout)
                .await?;
            let headers = &exchange.parts.headers;
            grpc_status(headers, exchange.trailers.as_ref())?;
            let attachments = result_attachments(headers, exchange.trailers.as_ref());
            let body = exchange.body;
            let value = if body.is_empty() {
                Value::Null
            } else {
                TripleResponseWrapper::decode(read_frame(body)?)?.get_value()?
            };
            Ok(GenericResult { value, attachments })
        })
    }
}

pub struct TripleServiceFactory {
    client: Arc<UpstreamClient>,
}

impl TripleServiceFactory {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }
}

impl GenericServiceFactory for TripleServiceFactory {
    fn create(&self, config: &ReferenceConfig) -> Result<Arc<dyn GenericService>, BoxError> {
        if config.url.trim().is_empty() {
            return Err(format!("provider url is empty, interface: {}", config.interface).into());
        }
        Ok(Arc::new(TripleGenericService::new(
            self.client.clone(),
            config.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn reference() -> ReferenceConfig {
        ReferenceConfig {
            url: "http://127.0.0.1:20000/".to_owned(),
            interface: "com.demo.UserService".to_owned(),
            group: String::new(),
            version: "1.0.0".to_owned(),
            timeout: Duration::from_secs(5),
            retries: 0,
            cluster: "failover".to_owned(),
            load_balance: "random".to_owned(),
        }
    }

    #[test]
    fn test_frame() {
        let frame = TripleRequestWrapper::get_buf(
            vec!["java.lang.Long".to_owned()],
            &[json!(42)],
        )
        .unwrap();
        assert_eq!(frame[0], 0);
        let message = read_frame(frame).unwrap();
        let request = TripleRequestWrapper::decode(message).unwrap();
        assert_eq!(request.serialize_type, "fastjson");
        assert_eq!(request.args, vec![b"42".to_vec()]);
        assert_eq!(request.arg_types, vec!["java.lang.Long"]);

        assert!(read_frame(Bytes::from_static(&[0, 0, 0])).is_err());
        assert!(read_frame(Bytes::from_static(&[0, 0, 0, 0, 9, 1])).is_err());
    }

    #[test]
    fn test_assemble() {
        let service = TripleGenericService::new(Arc::new(UpstreamClient::default()), reference());
        let request = service
            .assemble(&GenericRequest {
                method: "queryUser".to_owned(),
                types: vec!["java.lang.String".to_owned()],
                values: vec![json!("bob")],
                attachments: HashMap::from([("uid".to_owned(), "1001".to_owned())]),
                timeout: Duration::from_millis(300),
            })
            .unwrap();
        assert_eq!(
            request.uri(),
            "http://127.0.0.1:20000/com.demo.UserService/queryUser"
        );
        assert_eq!(request.headers()[CONTENT_TYPE], GRPC_CONTENT_TYPE);
        assert_eq!(request.headers()["tri-service-version"], "1.0.0");
        assert!(request.headers().get("tri-service-group").is_none());
        assert_eq!(request.headers()["grpc-timeout"], "300m");
        assert_eq!(request.headers()["uid"], "1001");
    }

    #[test]
    fn test_load_balance() {
        let request = GenericRequest {
            method: "queryUser".to_owned(),
            ..Default::default()
        };
        let mut config = reference();
        config.url = "http://10.0.0.1:20000, http://10.0.0.2:20000/".to_owned();
        config.load_balance = LOAD_BALANCE_ROUND_ROBIN.to_owned();
        let service = TripleGenericService::new(Arc::new(UpstreamClient::default()), config.clone());
        let hosts: Vec<String> = (0..4)
            .map(|_| service.assemble(&request).unwrap().uri().host().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);

        config.load_balance = LOAD_BALANCE_RANDOM.to_owned();
        let service = TripleGenericService::new(Arc::new(UpstreamClient::default()), config.clone());
        for _ in 0..8 {
            let uri = service.assemble(&request).unwrap().uri().clone();
            assert!(["10.0.0.1", "10.0.0.2"].contains(&uri.host().unwrap_or_default()));
        }

        config.url = " , ".to_owned();
        let service = TripleGenericService::new(Arc::new(UpstreamClient::default()), config);
        assert!(service.assemble(&request).is_err());
    }

    #[test]
    fn test_grpc_status_and_attachments() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        headers.insert(HEADER_HTTP_STATUS, HeaderValue::from_static("201"));
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        trailers.insert("x-trace", HeaderValue::from_static("t-1"));
        assert!(grpc_status(&headers, Some(&trailers)).is_ok());
        let attachments = result_attachments(&headers, Some(&trailers));
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[ATTACHMENT_HTTP_STATUS], json!("201"));
        assert_eq!(attachments["x-trace"], json!("t-1"));

        trailers.insert("grpc-status", HeaderValue::from_static("13"));
        trailers.insert("grpc-message", HeaderValue::from_static("user%20missing"));
        let error = grpc_status(&headers, Some(&trailers)).unwrap_err();
        assert!(error.to_string().contains("user missing"));
    }

    #[test]
    fn test_factory_requires_url() {
        let factory = TripleServiceFactory::new(Arc::new(UpstreamClient::default()));
        let mut config = reference();
        assert!(factory.create(&config).is_ok());
        config.url.clear();
        assert!(factory.create(&config).is_err());
    }
}
