//! Upstream fetching
//!
//! The dispatcher only sees the [`Fetch`] capability. [`UpstreamClient`] is
//! the production implementation: a pooled `reqwest` client that never
//! follows redirects and streams response bodies back without buffering.

use crate::policy::HOP_BY_HOP;
use futures::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, ACCEPT, ACCEPT_ENCODING,
    ACCEPT_LANGUAGE, CONNECTION, CONTENT_LENGTH, HOST, USER_AGENT,
};
use hyper::{Method, Response};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy produces
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// A fully buffered body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Error type for upstream fetches
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network, DNS or TLS failure reaching the target
    #[error("{0}")]
    Client(#[from] reqwest::Error),
    /// The upstream request could not be built
    #[error("invalid upstream request: {0}")]
    RequestBuild(String),
}

/// A request to send upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The fetch capability: one request in, one response (headers + streaming body) out
pub trait Fetch: Send + Sync + 'static {
    fn fetch(
        &self,
        request: UpstreamRequest,
    ) -> impl Future<Output = Result<Response<ProxyBody>, FetchError>> + Send;
}

/// Headers the proxy presents upstream in place of the client's own
#[derive(Debug, Clone)]
pub struct RequestProfile {
    user_agent: HeaderValue,
    accept: HeaderValue,
    accept_language: HeaderValue,
}

impl RequestProfile {
    pub fn new(
        user_agent: &str,
        accept: &str,
        accept_language: &str,
    ) -> Result<Self, InvalidHeaderValue> {
        Ok(Self {
            user_agent: HeaderValue::from_str(user_agent)?,
            accept: HeaderValue::from_str(accept)?,
            accept_language: HeaderValue::from_str(accept_language)?,
        })
    }

    /// Build upstream request headers from the client's.
    ///
    /// Hop-by-hop headers, `Host`, `Content-Length` and `Accept-Encoding`
    /// are dropped (the client recomputes or negotiates them), then the
    /// profile headers override whatever the client sent.
    pub fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(inbound.len() + 4);
        for (name, value) in inbound {
            if is_stripped_request_header(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        headers.insert(USER_AGENT, self.user_agent.clone());
        headers.insert(ACCEPT, self.accept.clone());
        headers.insert(ACCEPT_LANGUAGE, self.accept_language.clone());
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }
}

fn is_stripped_request_header(name: &HeaderName) -> bool {
    *name == HOST
        || *name == CONTENT_LENGTH
        || *name == ACCEPT_ENCODING
        || HOP_BY_HOP.contains(&name.as_str())
}

/// Statistics for upstream fetches
#[derive(Debug, Default)]
pub struct FetchStats {
    /// Total number of upstream requests sent
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl FetchStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum idle connections per upstream host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Connect timeout; `None` waits as long as the OS does
    pub connect_timeout: Option<Duration>,
    /// Honour `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` from the environment
    pub use_system_proxy: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: None,
            use_system_proxy: false,
        }
    }
}

/// Pooled HTTP(S) client for upstream fetches
pub struct UpstreamClient {
    client: reqwest::Client,
    stats: Arc<FetchStats>,
}

impl UpstreamClient {
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout);
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_secs = config.connect_timeout.map(|t| t.as_secs()),
            system_proxy = config.use_system_proxy,
            "Upstream client initialized"
        );

        Ok(Self {
            client,
            stats: Arc::new(FetchStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<FetchStats> {
        Arc::clone(&self.stats)
    }
}

impl Fetch for UpstreamClient {
    fn fetch(
        &self,
        request: UpstreamRequest,
    ) -> impl Future<Output = Result<Response<ProxyBody>, FetchError>> + Send {
        let client = self.client.clone();
        let stats = Arc::clone(&self.stats);

        async move {
            stats.record_request();

            let result = client
                .request(request.method, request.url)
                .headers(request.headers)
                .body(request.body)
                .send()
                .await;
            let upstream = match result {
                Ok(response) => response,
                Err(e) => {
                    stats.record_failure();
                    return Err(e.into());
                }
            };

            let mut builder = Response::builder().status(upstream.status());
            if let Some(headers) = builder.headers_mut() {
                *headers = upstream.headers().clone();
            }

            let body = StreamBody::new(
                upstream
                    .bytes_stream()
                    .map_ok(Frame::data)
                    .map_err(|e| Box::new(e) as BoxError),
            )
            .boxed_unsync();

            builder
                .body(body)
                .map_err(|e| FetchError::RequestBuild(e.to_string()))
        }
    }
}
