//! Error taxonomy and plain-text error responses for the proxy

use crate::policy::HeaderPolicy;
use crate::rewrite::RewriteError;
use crate::upstream::{full_body, FetchError, ProxyBody};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Neither `url` nor `q` was supplied
    MissingTarget,
    /// The target points back at this proxy
    LoopDetected,
    /// The upstream could not be reached
    UpstreamFetchFailed,
    /// The upstream HTML could not be parsed
    HtmlParseFailed,
    /// The upstream HTML exceeded the buffering cap
    DocumentTooLarge,
    /// The inbound request body exceeded the buffering cap
    RequestTooLarge,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingTarget => StatusCode::BAD_REQUEST,
            ProxyErrorCode::LoopDetected => StatusCode::LOOP_DETECTED,
            ProxyErrorCode::UpstreamFetchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::HtmlParseFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::DocumentTooLarge => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingTarget => "MISSING_TARGET",
            ProxyErrorCode::LoopDetected => "LOOP_DETECTED",
            ProxyErrorCode::UpstreamFetchFailed => "UPSTREAM_FETCH_FAILED",
            ProxyErrorCode::HtmlParseFailed => "HTML_PARSE_FAILED",
            ProxyErrorCode::DocumentTooLarge => "DOCUMENT_TOO_LARGE",
            ProxyErrorCode::RequestTooLarge => "REQUEST_TOO_LARGE",
        }
    }
}

/// Errors that end a request before an upstream response can be returned.
///
/// The `Display` output is the response body sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Missing ?url parameter")]
    MissingTarget,
    #[error("Proxy loop detected: {0} points back at this proxy")]
    LoopDetected(String),
    #[error("Proxy error: {0}")]
    InvalidTarget(String),
    #[error("Proxy error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Proxy error: failed to read body: {0}")]
    Body(String),
    #[error("Proxy error: upstream document exceeds {limit} bytes")]
    DocumentTooLarge { limit: usize },
    #[error("Proxy error: request body exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },
    #[error("Failed to parse HTML")]
    HtmlParse(#[source] RewriteError),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::MissingTarget => ProxyErrorCode::MissingTarget,
            ProxyError::LoopDetected(_) => ProxyErrorCode::LoopDetected,
            ProxyError::InvalidTarget(_) | ProxyError::Fetch(_) | ProxyError::Body(_) => {
                ProxyErrorCode::UpstreamFetchFailed
            }
            ProxyError::DocumentTooLarge { .. } => ProxyErrorCode::DocumentTooLarge,
            ProxyError::RequestTooLarge { .. } => ProxyErrorCode::RequestTooLarge,
            ProxyError::HtmlParse(_) => ProxyErrorCode::HtmlParseFailed,
        }
    }

    /// Whether the client, rather than the upstream or the proxy, caused the error
    pub fn is_client_error(&self) -> bool {
        self.code().status_code().is_client_error()
            || matches!(self, ProxyError::LoopDetected(_))
    }

    /// Build the plain-text error response; the header policy applies to it too
    pub fn into_response(self, policy: &HeaderPolicy) -> Response<ProxyBody> {
        error_response(self.code(), self.to_string(), policy)
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
    policy: &HeaderPolicy,
) -> Response<ProxyBody> {
    let mut response = Response::builder()
        .status(code.status_code())
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_PROXY_ERROR, HeaderValue::from_static(code.as_header_value()))
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers");

    policy.apply(response.headers_mut());
    response
}
