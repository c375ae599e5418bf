use std::fmt::{self, Display, Formatter};

use http::HeaderMap;
use serde_json::{json, Value};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Symbolic error codes carried by every [`ServeError`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RouteNotFound,
    PermissionDenied,
    Unauthorized,
    RateLimited,
    ArgumentLookupFailed,
    ArgumentResolveFailed,
    RequestAssembleFailed,
    BackendRemoteFailed,
    BackendTimeout,
    BackendCircuited,
    ResponseDecodeFailed,
    ProtocolUnknown,
    Canceled,
    CriticalPanic,
    Internal,
    /// Codes reported by a backend, e.g. a permission service.
    Custom(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::RouteNotFound => "GATEWAY:ROUTE:NOT_FOUND",
            ErrorCode::PermissionDenied => "GATEWAY:PERMISSION:ACCESS_DENIED",
            ErrorCode::Unauthorized => "GATEWAY:AUTHORIZE:UNAUTHORIZED",
            ErrorCode::RateLimited => "GATEWAY:REQUEST:OVER_LIMIT",
            ErrorCode::ArgumentLookupFailed => "GATEWAY:ARGUMENT:LOOKUP",
            ErrorCode::ArgumentResolveFailed => "GATEWAY:ARGUMENT:RESOLVE",
            ErrorCode::RequestAssembleFailed => "GATEWAY:REQUEST:ASSEMBLE",
            ErrorCode::BackendRemoteFailed => "GATEWAY:BACKEND:REMOTE",
            ErrorCode::BackendTimeout => "GATEWAY:BACKEND:TIMEOUT",
            ErrorCode::BackendCircuited => "GATEWAY:BACKEND:CIRCUITED",
            ErrorCode::ResponseDecodeFailed => "GATEWAY:RESPONSE:DECODE",
            ErrorCode::ProtocolUnknown => "GATEWAY:PROTOCOL:UNKNOWN",
            ErrorCode::Canceled => "GATEWAY:REQUEST:CANCELED",
            ErrorCode::CriticalPanic => "GATEWAY:INTERNAL:PANIC",
            ErrorCode::Internal => "GATEWAY:INTERNAL",
            ErrorCode::Custom(code) => code,
        }
    }

    pub fn default_status(&self) -> u16 {
        match self {
            ErrorCode::RouteNotFound => 404,
            ErrorCode::Unauthorized => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::RateLimited => 429,
            ErrorCode::ArgumentLookupFailed
            | ErrorCode::ArgumentResolveFailed
            | ErrorCode::RequestAssembleFailed => 400,
            ErrorCode::BackendRemoteFailed => 502,
            ErrorCode::BackendCircuited => 503,
            ErrorCode::BackendTimeout => 504,
            // nginx convention for "client closed request"
            ErrorCode::Canceled => 499,
            ErrorCode::ResponseDecodeFailed
            | ErrorCode::ProtocolUnknown
            | ErrorCode::CriticalPanic
            | ErrorCode::Internal
            | ErrorCode::Custom(_) => 500,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized error envelope handed to the response writer.
///
/// The cause is kept for logging and is never part of [`ServeError::to_body`].
#[derive(Error, Debug)]
#[error("[{error_code}] {message}")]
pub struct ServeError {
    pub status_code: u16,
    pub error_code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
    pub headers: HeaderMap,
}

impl ServeError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status_code: error_code.default_status(),
            error_code,
            message: message.into(),
            cause: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        let _ = self.cause.insert(cause.into());
        self
    }

    pub fn route_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RouteNotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn protocol_unknown(protocol: &str) -> Self {
        Self::new(
            ErrorCode::ProtocolUnknown,
            format!("transporter not found, protocol: {protocol}"),
        )
    }

    pub fn remote(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::new(ErrorCode::BackendRemoteFailed, message).with_cause(cause)
    }

    pub fn decode(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::new(ErrorCode::ResponseDecodeFailed, message).with_cause(cause)
    }

    pub fn assemble(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::new(ErrorCode::RequestAssembleFailed, message).with_cause(cause)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn is_canceled(&self) -> bool {
        self.error_code == ErrorCode::Canceled
    }

    pub fn to_body(&self) -> Value {
        json!({
            "status": self.status_code,
            "code": self.error_code.as_str(),
            "message": self.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status() {
        assert_eq!(ServeError::route_not_found("x").status_code, 404);
        assert_eq!(ServeError::canceled("x").status_code, 499);
        assert_eq!(ServeError::protocol_unknown("GRPC").status_code, 500);
        let error = ServeError::permission_denied("denied").with_status(401);
        assert_eq!(error.status_code, 401);
        assert_eq!(error.error_code, ErrorCode::PermissionDenied);
        assert_eq!(ErrorCode::Unauthorized.default_status(), 401);
        assert_eq!(ErrorCode::RateLimited.default_status(), 429);
        assert_eq!(ErrorCode::BackendCircuited.default_status(), 503);
    }

    #[test]
    fn test_body_hides_cause() {
        let error = ServeError::remote("remote error", "connection refused");
        let body = error.to_body();
        assert_eq!(body["code"], "GATEWAY:BACKEND:REMOTE");
        assert_eq!(body["status"], 502);
        assert!(body.get("cause").is_none());
        assert!(std::error::Error::source(&error).is_some());
    }
}
