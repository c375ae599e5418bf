use std::{str::FromStr, sync::Arc, time::Instant};

use fusen_gateway_common::{
    context::Context,
    error::{ErrorCode, ServeError},
    BoxFutureV2,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Filter, FilterResult, FilterSelector, ProceedingJoinPoint};
use crate::{config::JwtFilterConfig, error::GatewayError, lookup::lookup_text};

pub const JWT_FILTER_ID: &str = "jwt_filter";
pub const JWT_REQUIRES_TOKEN: &str = "JWT:REQUIRES_TOKEN";
pub const JWT_ILLEGAL_TOKEN: &str = "JWT:ILLEGAL_TOKEN";

pub const ATTR_JWT_TOKEN: &str = "X-Jwt-Token";
pub const ATTR_JWT_ISSUER: &str = "X-Jwt-Issuer";
pub const ATTR_JWT_SUBJECT: &str = "X-Jwt-Subject";
/// Every verified claim; the `:` keeps it out of forwarded headers.
pub const ATTR_JWT_CLAIMS: &str = "jwt:claims";

/// Verifies the bearer token of endpoints that require authorization and
/// exposes its claims as request attributes.
pub struct JwtFilter {
    lookup_token: String,
    issuer_key: String,
    subject_key: String,
    key: DecodingKey,
    validation: Validation,
}

impl JwtFilter {
    pub fn new(config: &JwtFilterConfig) -> Result<Self, GatewayError> {
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|error| {
            GatewayError::Config(format!("jwt algorithm {}: {error}", config.algorithm))
        })?;
        let pem = config.public_key.as_bytes();
        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                if config.secret.is_empty() {
                    return Err(GatewayError::Config("jwt secret is empty".to_owned()));
                }
                Ok(DecodingKey::from_secret(config.secret.as_bytes()))
            }
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
            _ => DecodingKey::from_rsa_pem(pem),
        }
        .map_err(|error| GatewayError::Config(format!("jwt public key: {error}")))?;
        let mut validation = Validation::new(algorithm);
        validation.leeway = config.leeway;
        if !config.issuers.is_empty() {
            validation.set_issuer(&config.issuers);
        }
        Ok(Self {
            lookup_token: config.lookup_token.clone(),
            issuer_key: config.issuer_key.clone(),
            subject_key: config.subject_key.clone(),
            key,
            validation,
        })
    }

    fn token(&self, ctx: &Context) -> Result<String, ServeError> {
        let value = lookup_text(ctx, &self.lookup_token).map_err(|error| {
            ServeError::new(ErrorCode::ArgumentLookupFailed, error.to_string())
        })?;
        let token = value
            .as_deref()
            .map(strip_bearer)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ServeError::new(ErrorCode::Unauthorized, JWT_REQUIRES_TOKEN))?;
        Ok(token.to_owned())
    }

    fn verify(&self, token: &str) -> Result<Map<String, Value>, ServeError> {
        decode::<Map<String, Value>>(token, &self.key, &self.validation)
            .map(|e| e.claims)
            .map_err(|error| {
                debug!(%error, "jwt verification failed");
                ServeError::new(ErrorCode::Unauthorized, JWT_ILLEGAL_TOKEN).with_cause(error)
            })
    }
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}

impl Filter for JwtFilter {
    fn filter_id(&self) -> &str {
        JWT_FILTER_ID
    }

    fn order(&self) -> i32 {
        -200
    }

    fn call<'a>(&'a self, join_point: ProceedingJoinPoint<'a>) -> BoxFutureV2<'a, FilterResult> {
        Box::pin(async move {
            let start = Instant::now();
            let ctx = &mut *join_point.context;
            let token = self.token(ctx)?;
            let claims = self.verify(&token)?;
            let issuer = claims.get(&self.issuer_key).cloned().unwrap_or(Value::Null);
            let subject = claims.get(&self.subject_key).cloned().unwrap_or(Value::Null);
            ctx.set_attribute(ATTR_JWT_TOKEN, Value::String(token));
            ctx.set_attribute(ATTR_JWT_ISSUER, issuer);
            ctx.set_attribute(ATTR_JWT_SUBJECT, subject);
            ctx.set_attribute(ATTR_JWT_CLAIMS, Value::Object(claims));
            ctx.add_metric(JWT_FILTER_ID, start.elapsed());
            join_point.proceed().await
        })
    }
}

/// Activates the [`JwtFilter`] on endpoints marked as requiring authorization.
pub struct JwtFilterSelector {
    filter: Arc<dyn Filter>,
}

impl JwtFilterSelector {
    pub fn new(filter: Arc<JwtFilter>) -> Self {
        Self { filter }
    }
}

impl FilterSelector for JwtFilterSelector {
    fn activate(&self, ctx: &Context) -> bool {
        ctx.endpoint().is_some_and(|e| e.is_authorize())
    }

    fn do_select(&self, _ctx: &Context) -> Vec<Arc<dyn Filter>> {
        vec![self.filter.clone()]
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use fusen_gateway_common::{
        context::{CancelSignal, WebRequest},
        model::Endpoint,
    };
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::*;
    use crate::filter::{
        tests::{record, RecordInvoker, Trace},
        FilterChain,
    };

    const SECRET: &str = "gateway-secret";

    fn token(secret: &str, expires_in: i64) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let claims = json!({
            "iss": "auth-center",
            "sub": "u-1001",
            "role": "admin",
            "exp": now + expires_in,
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn chain(trace: &Trace) -> FilterChain {
        let config = JwtFilterConfig {
            secret: SECRET.to_owned(),
            leeway: 0,
            ..Default::default()
        };
        let jwt = Arc::new(JwtFilter::new(&config).unwrap());
        FilterChain::new(
            vec![record("outer", -500, trace, false), record("inner", 0, trace, false)],
            vec![Arc::new(JwtFilterSelector::new(jwt))],
        )
    }

    fn context(authorize: bool, authorization: Option<String>) -> Context {
        let mut request = WebRequest::new("GET", "/orders");
        if let Some(authorization) = authorization {
            request = request.with_header("Authorization", &authorization);
        }
        let mut ctx = Context::new(request, CancelSignal::never());
        ctx.set_endpoint(Arc::new(Endpoint {
            authorize,
            ..Default::default()
        }));
        ctx
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bearer  abc "), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
        assert_eq!(strip_bearer("Bearer"), "Bearer");
    }

    #[test]
    fn test_key_config() {
        assert!(JwtFilter::new(&JwtFilterConfig::default()).is_err());
        let config = JwtFilterConfig {
            algorithm: "RS256".to_owned(),
            public_key: "not a pem".to_owned(),
            ..Default::default()
        };
        assert!(JwtFilter::new(&config).is_err());
        let config = JwtFilterConfig {
            algorithm: "HS1".to_owned(),
            secret: SECRET.to_owned(),
            ..Default::default()
        };
        assert!(JwtFilter::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_verified_claims_in_onion_order() {
        let trace = Trace::default();
        let chain = chain(&trace);
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };
        let mut ctx = context(true, Some(format!("Bearer {}", token(SECRET, 600))));
        let response = chain.execute(&mut ctx, &invoker).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer:in", "inner:in", "terminal", "inner:out", "outer:out"]
        );
        let seen = response.body.as_value().unwrap().as_array().unwrap().clone();
        assert!(seen.contains(&json!(ATTR_JWT_SUBJECT)));
        assert_eq!(ctx.attribute(ATTR_JWT_SUBJECT), Some(&json!("u-1001")));
        assert_eq!(ctx.attribute(ATTR_JWT_ISSUER), Some(&json!("auth-center")));
        assert_eq!(ctx.attribute(ATTR_JWT_CLAIMS).unwrap()["role"], "admin");
        assert!(ctx.metrics().iter().any(|e| e.name == JWT_FILTER_ID));
    }

    #[tokio::test]
    async fn test_rejected_tokens() {
        let trace = Trace::default();
        let chain = chain(&trace);
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };

        let mut ctx = context(true, None);
        let error = chain.execute(&mut ctx, &invoker).await.unwrap_err();
        assert_eq!(error.error_code, ErrorCode::Unauthorized);
        assert_eq!(error.status_code, 401);
        assert_eq!(error.message, JWT_REQUIRES_TOKEN);
        assert_eq!(*trace.lock().unwrap(), vec!["outer:in", "outer:out"]);

        for authorization in [
            format!("Bearer {}", token("other-secret", 600)),
            format!("Bearer {}", token(SECRET, -600)),
            "Bearer not.a.token".to_owned(),
        ] {
            let mut ctx = context(true, Some(authorization));
            let error = chain.execute(&mut ctx, &invoker).await.unwrap_err();
            assert_eq!(error.message, JWT_ILLEGAL_TOKEN);
            assert!(ctx.attribute(ATTR_JWT_SUBJECT).is_none());
        }
    }

    #[tokio::test]
    async fn test_inactive_without_authorize() {
        let trace = Trace::default();
        let chain = chain(&trace);
        let invoker = RecordInvoker {
            trace: trace.clone(),
        };
        let mut ctx = context(false, None);
        chain.execute(&mut ctx, &invoker).await.unwrap();
        assert!(ctx.attribute(ATTR_JWT_TOKEN).is_none());
        assert_eq!(trace.lock().unwrap().len(), 5);
    }
}
