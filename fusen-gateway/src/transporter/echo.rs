use std::{collections::BTreeMap, sync::Arc};

use fusen_gateway_common::{
    context::Context, error::ServeError, model::Service, response::ServeResponse, BoxFutureV2,
};
use serde_json::{json, Map, Value};

use super::{Transporter, TransporterCodec};

/// Answers with a description of the inbound request, for debugging routes.
pub struct EchoTransporter {
    codec: TransporterCodec<Value>,
}

impl Default for EchoTransporter {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoTransporter {
    pub fn new() -> Self {
        Self {
            codec: Arc::new(|value: Value| Ok(ServeResponse::ok(value))),
        }
    }

    pub fn with_codec(mut self, codec: TransporterCodec<Value>) -> Self {
        self.codec = codec;
        self
    }
}

fn echo_request(ctx: &Context, service: &Service) -> Value {
    let request = ctx.request();
    let headers: BTreeMap<&str, Vec<&str>> =
        request
            .headers
            .keys()
            .fold(BTreeMap::new(), |mut headers, name| {
                let values = request
                    .headers
                    .get_all(name)
                    .iter()
                    .filter_map(|e| e.to_str().ok())
                    .collect();
                headers.insert(name.as_str(), values);
                headers
            });
    let mut echo = Map::new();
    echo.insert("service".to_owned(), json!(service.id()));
    echo.insert("request-id".to_owned(), json!(ctx.request_id()));
    echo.insert("request-uri".to_owned(), json!(request.uri));
    echo.insert("request-method".to_owned(), json!(request.method));
    echo.insert("request-pathValues".to_owned(), json!(request.path_values));
    echo.insert("request-queryValues".to_owned(), json!(request.query_values));
    echo.insert("request-formValues".to_owned(), json!(request.form_values));
    echo.insert("request-headerValues".to_owned(), json!(headers));
    echo.insert(
        "request-body".to_owned(),
        json!(String::from_utf8_lossy(&request.body)),
    );
    Value::Object(echo)
}

impl Transporter for EchoTransporter {
    fn do_invoke<'a>(
        &'a self,
        ctx: &'a Context,
        service: &'a Service,
    ) -> BoxFutureV2<'a, Result<ServeResponse, ServeError>> {
        Box::pin(async move {
            (self.codec)(echo_request(ctx, service))
                .map_err(|error| ServeError::decode("echo response decode failed", error))
        })
    }
}

#[cfg(test)]
mod tests {
    use fusen_gateway_common::context::{CancelSignal, WebRequest};

    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let request = WebRequest::new("post", "/users/42?expand=true")
            .with_header("X-Tenant", "t1")
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_path_value("id", "42")
            .with_body("name=bob");
        let ctx = Context::new(request, CancelSignal::never());
        let service = Service {
            interface: "debug".to_owned(),
            method: "echo".to_owned(),
            ..Default::default()
        };
        let response = EchoTransporter::new()
            .do_invoke(&ctx, &service)
            .await
            .unwrap();
        let body = response.body.as_value().unwrap();
        assert_eq!(body["service"], "debug:echo");
        assert_eq!(body["request-method"], "POST");
        assert_eq!(body["request-uri"], "/users/42?expand=true");
        assert_eq!(body["request-pathValues"]["id"], "42");
        assert_eq!(body["request-queryValues"]["expand"][0], "true");
        assert_eq!(body["request-formValues"]["name"][0], "bob");
        assert_eq!(body["request-headerValues"]["x-tenant"][0], "t1");
        assert_eq!(body["request-body"], "name=bob");
        assert_eq!(body["request-id"], json!(ctx.request_id()));
    }

    #[tokio::test]
    async fn test_codec_failure() {
        let transporter = EchoTransporter::new().with_codec(Arc::new(|_: Value| {
            Err("unsupported".into())
        }));
        let ctx = Context::new(WebRequest::new("GET", "/"), CancelSignal::never());
        let error = transporter
            .do_invoke(&ctx, &Service::default())
            .await
            .unwrap_err();
        assert_eq!(error.status_code, 500);
        assert_eq!(error.error_code.as_str(), "GATEWAY:RESPONSE:DECODE");
    }
}
