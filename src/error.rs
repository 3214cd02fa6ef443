//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Boxed error used as the body error type for proxied responses
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body type shared by the proxy and the admin console
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Wrap bytes into a [`ProxyBody`]
pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No entrypoint is configured for the local endpoint
    NoEntrypoint,
    /// Request body could not be read or parsed
    BadRequest,
    /// Unknown admin console path
    NotFound,
    /// Request timed out waiting for the upstream
    RequestTimeout,
    /// Failed to connect to the upstream
    ConnectionFailed,
    /// Exitpoint has an unusable destination
    UpstreamConfigError,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NoEntrypoint => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::NoEntrypoint => "NO_ENTRYPOINT",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::UpstreamConfigError => "UPSTREAM_CONFIG_ERROR",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Settings validation and persistence failures
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings graph is inconsistent; the message names the offending object
    #[error("{0}")]
    Invalid(String),
    #[error("settings file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Certificate lifecycle failures
#[derive(Debug, Error)]
pub enum CertError {
    /// Ineligible configuration; acquisition was not attempted
    #[error("{0}")]
    Validation(String),
    /// The ACME server rejected or timed out a challenge or order
    #[error("challenge failed: {0}")]
    Challenge(String),
    /// Network failure reaching the ACME server or the DNS provider
    #[error("transport error: {0}")]
    Transport(String),
    /// Certificate read or write failure
    #[error("certificate file error: {0}")]
    FileIo(#[from] std::io::Error),
    /// Local key or certificate generation failure
    #[error("certificate generation failed: {0}")]
    Generation(String),
    /// A due renewal could not be handed to the background worker
    #[error("renewal not queued: {0}")]
    Queue(String),
}

impl From<instant_acme::Error> for CertError {
    fn from(err: instant_acme::Error) -> Self {
        match &err {
            instant_acme::Error::Api(_) => CertError::Challenge(err.to_string()),
            _ => CertError::Transport(err.to_string()),
        }
    }
}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::Generation(err.to_string())
    }
}

impl From<DnsError> for CertError {
    fn from(err: DnsError) -> Self {
        match err {
            DnsError::MissingToken | DnsError::NoZone(_) => CertError::Validation(err.to_string()),
            _ => CertError::Transport(err.to_string()),
        }
    }
}

impl From<SettingsError> for CertError {
    fn from(err: SettingsError) -> Self {
        CertError::Validation(err.to_string())
    }
}

/// DNS provider API failures
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("DNS provider API token is not configured")]
    MissingToken,
    #[error("no DNS zone in the provider account matches {0}")]
    NoZone(String),
    #[error("DNS provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("DNS provider rejected the request: {0}")]
    Api(String),
    #[error("DNS lookup failed: {0}")]
    Resolve(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::NoEntrypoint.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::NotFound, "Unknown path: /api/nope");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"Unknown path: /api/nope\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_dns_errors_map_to_cert_taxonomy() {
        assert!(matches!(
            CertError::from(DnsError::MissingToken),
            CertError::Validation(_)
        ));
        assert!(matches!(
            CertError::from(DnsError::Api("rate limited".into())),
            CertError::Transport(_)
        ));
    }
}
