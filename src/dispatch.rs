//! Per-request dispatch: resolve the target, fetch it, then either rewrite
//! the HTML or stream the body through untouched.
//!
//! Every response leaving the dispatcher, errors included, carries the
//! header policy and an `x-request-id`.

use crate::error::ProxyError;
use crate::origin::{ProxyOrigin, RewriteContext};
use crate::policy::{is_html, HeaderPolicy};
use crate::rewrite::{rewrite_document, DocumentRewriter};
use crate::target::{normalize, TargetQuery};
use crate::upstream::{
    full_body, BoxError, Fetch, ProxyBody, RequestProfile, UpstreamClient, UpstreamRequest,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::HeaderValue;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Default cap on a buffered HTML document (10 MiB)
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

/// Default cap on a buffered inbound request body (10 MiB)
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// Handles proxy requests against a [`Fetch`] implementation
pub struct Dispatcher<F = UpstreamClient> {
    fetcher: F,
    origin: ProxyOrigin,
    policy: HeaderPolicy,
    profile: RequestProfile,
    max_document_bytes: usize,
    max_request_bytes: usize,
    rewriter: DocumentRewriter,
}

impl<F: Fetch> Dispatcher<F> {
    pub fn new(fetcher: F, origin: ProxyOrigin, policy: HeaderPolicy, profile: RequestProfile) -> Self {
        Self {
            fetcher,
            origin,
            policy,
            profile,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            rewriter: rewrite_document,
        }
    }

    /// Set the largest HTML document that will be buffered for rewriting
    pub fn with_max_document_bytes(mut self, limit: usize) -> Self {
        self.max_document_bytes = limit;
        self
    }

    /// Set the largest inbound request body that will be forwarded
    pub fn with_max_request_bytes(mut self, limit: usize) -> Self {
        self.max_request_bytes = limit;
        self
    }

    /// Replace the document rewrite pass applied to HTML responses
    pub fn with_rewriter(mut self, rewriter: DocumentRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn origin(&self) -> &ProxyOrigin {
        &self.origin
    }

    /// Handle one inbound request. Never fails: errors become responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut response = match self.dispatch(req, &request_id).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    warn!(request_id, error = %e, "Rejected request");
                } else {
                    error!(request_id, error = %e, "Proxy request failed");
                }
                e.into_response(&self.policy)
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }

    async fn dispatch<B>(&self, req: Request<B>, request_id: &str) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let target = self.resolve_target(req.uri().query())?;
        debug!(request_id, method = %req.method(), target = %target, "Resolved target");

        let (parts, body) = req.into_parts();
        let limit = self.max_request_bytes;
        let body = collect_limited(body, limit)
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::RequestTooLarge { limit }
                } else {
                    ProxyError::Body(e.to_string())
                }
            })?
            .to_bytes();
        let head = parts.method == Method::HEAD;

        let upstream = UpstreamRequest {
            method: parts.method,
            url: target.clone(),
            headers: self.profile.outbound_headers(&parts.headers),
            body,
        };
        let response = self.fetcher.fetch(upstream).await?;

        let rewritten = !head && has_body(response.status()) && is_html(response.headers());
        debug!(
            request_id,
            target = %target,
            status = response.status().as_u16(),
            rewritten,
            "Upstream responded"
        );

        if rewritten {
            self.rewrite_html(response, &target).await
        } else {
            Ok(self.passthrough(response))
        }
    }

    /// Work out the target URL from the inbound query string.
    ///
    /// `url` wins over `q`; a target served by this proxy is a loop.
    pub fn resolve_target(&self, query: Option<&str>) -> Result<Url, ProxyError> {
        let raw = TargetQuery::parse(query)
            .raw_target()
            .ok_or(ProxyError::MissingTarget)?;
        let normalized = normalize(&raw);

        let target = Url::parse(&normalized)
            .map_err(|e| ProxyError::InvalidTarget(format!("invalid URL '{}': {}", normalized, e)))?;

        if self.origin.contains(&target) {
            return Err(ProxyError::LoopDetected(target.to_string()));
        }
        Ok(target)
    }

    async fn rewrite_html(
        &self,
        response: Response<ProxyBody>,
        target: &Url,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (mut parts, body) = response.into_parts();
        let limit = self.max_document_bytes;

        let bytes = collect_limited(body, limit)
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::DocumentTooLarge { limit }
                } else {
                    ProxyError::Body(e.to_string())
                }
            })?
            .to_bytes();

        let html = String::from_utf8_lossy(&bytes);
        let ctx = RewriteContext::new(target, &self.origin);
        let document = (self.rewriter)(&html, &ctx).map_err(ProxyError::HtmlParse)?;

        self.policy.apply_rewritten(&mut parts.headers, document.len());
        Ok(Response::from_parts(parts, full_body(document)))
    }

    fn passthrough(&self, response: Response<ProxyBody>) -> Response<ProxyBody> {
        let (mut parts, body) = response.into_parts();
        self.policy.apply(&mut parts.headers);
        Response::from_parts(parts, body)
    }
}

/// Informational, 204 and 304 responses never carry a body
fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}


/// Buffer `body` up to `limit` bytes. Boxed so the future is `Send` without
/// tripping rustc's higher-ranked lifetime inference inside async fns.
fn collect_limited<B>(
    body: B,
    limit: usize,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<http_body_util::Collected<Bytes>, BoxError>> + Send>,
>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    Box::pin(Limited::new(body, limit).collect())
}
