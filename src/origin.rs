//! Proxy origin and proxied-link construction
//!
//! A proxied link has the shape `<origin>/?url=<percent-encoded absolute URL>`.
//! References that already point at the proxy origin are never wrapped a
//! second time.

use std::fmt;
use url::{Origin, Url};

/// Errors from parsing the configured proxy origin
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("invalid proxy origin '{0}': {1}")]
    Parse(String, url::ParseError),
    #[error("proxy origin '{0}' must use http or https")]
    Scheme(String),
    #[error("proxy origin '{0}' must not carry a path, query or fragment")]
    NotAnOrigin(String),
}

/// The scheme, host and port under which this proxy is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOrigin {
    origin: Origin,
    serialized: String,
}

impl ProxyOrigin {
    pub fn parse(input: &str) -> Result<Self, OriginError> {
        let url = Url::parse(input).map_err(|e| OriginError::Parse(input.to_string(), e))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(OriginError::Scheme(input.to_string()));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(OriginError::NotAnOrigin(input.to_string()));
        }

        let origin = url.origin();
        let serialized = origin.ascii_serialization();
        Ok(Self { origin, serialized })
    }

    /// `scheme://host[:port]`, no trailing slash
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Whether `url` is served by this proxy
    pub fn contains(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    /// Wrap an absolute URL as a proxied link
    pub fn wrap(&self, absolute: &Url) -> String {
        format!(
            "{}/?url={}",
            self.serialized,
            urlencoding::encode(absolute.as_str())
        )
    }
}

impl fmt::Display for ProxyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

/// Outcome of rewriting one reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRewrite {
    /// The reference now routes through the proxy
    Proxied(String),
    /// The reference already resolves to the proxy origin
    AlreadyProxied,
    /// The reference resolves to a scheme the proxy cannot fetch (data:, blob:, ...)
    NotFetchable,
    /// The reference could not be resolved against the base
    Unresolvable,
}

impl LinkRewrite {
    pub fn is_proxied(&self) -> bool {
        matches!(self, LinkRewrite::Proxied(_))
    }

    /// The proxied link, or `original` for every fallback case
    pub fn or_original(self, original: &str) -> String {
        match self {
            LinkRewrite::Proxied(link) => link,
            _ => original.to_string(),
        }
    }
}

/// The base URL and proxy origin shared by every rewrite in one document pass
#[derive(Debug, Clone, Copy)]
pub struct RewriteContext<'a> {
    base: &'a Url,
    origin: &'a ProxyOrigin,
}

impl<'a> RewriteContext<'a> {
    pub fn new(base: &'a Url, origin: &'a ProxyOrigin) -> Self {
        Self { base, origin }
    }

    /// Resolve `reference` against the base and wrap it as a proxied link
    pub fn rewrite(&self, reference: &str) -> LinkRewrite {
        let absolute = match self.base.join(reference) {
            Ok(url) => url,
            Err(_) => return LinkRewrite::Unresolvable,
        };

        if self.origin.contains(&absolute) {
            return LinkRewrite::AlreadyProxied;
        }
        if !matches!(absolute.scheme(), "http" | "https") {
            return LinkRewrite::NotFetchable;
        }

        LinkRewrite::Proxied(self.origin.wrap(&absolute))
    }

    /// [`rewrite`](Self::rewrite), falling back to the untouched reference
    pub fn proxy_url(&self, reference: &str) -> String {
        self.rewrite(reference).or_original(reference)
    }
}
