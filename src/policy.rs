//! Response header policy
//!
//! A fixed, ordered list of header mutations applied to every response the
//! proxy emits, whatever the upstream sent. Applying a policy twice gives the
//! same headers as applying it once.

use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_SECURITY_POLICY, CONTENT_TYPE, X_FRAME_OPTIONS,
};
use serde::Deserialize;

/// Content type of every rewritten HTML document
pub const REWRITTEN_HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Hop-by-hop headers; the proxy re-frames every body it forwards
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Whether proxied pages may be framed by other sites
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Forbid framing (`X-Frame-Options: DENY`, `frame-ancestors 'none'`)
    #[default]
    Restrictive,
    /// Drop upstream framing restrictions so any page can embed the proxy
    Permissive,
}

/// A single header mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderMutation {
    Set(HeaderName, HeaderValue),
    Remove(HeaderName),
}

impl HeaderMutation {
    fn apply(&self, headers: &mut HeaderMap) {
        match self {
            HeaderMutation::Set(name, value) => {
                headers.insert(name.clone(), value.clone());
            }
            HeaderMutation::Remove(name) => {
                headers.remove(name);
            }
        }
    }
}

/// Ordered header mutations applied to outbound responses
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    mutations: Vec<HeaderMutation>,
}

impl HeaderPolicy {
    pub fn new(framing: FramingMode) -> Self {
        let mut mutations = vec![HeaderMutation::Set(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        )];

        match framing {
            FramingMode::Restrictive => {
                mutations.push(HeaderMutation::Set(
                    X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ));
                mutations.push(HeaderMutation::Set(
                    CONTENT_SECURITY_POLICY,
                    HeaderValue::from_static("frame-ancestors 'none'"),
                ));
            }
            FramingMode::Permissive => {
                mutations.push(HeaderMutation::Remove(X_FRAME_OPTIONS));
                mutations.push(HeaderMutation::Remove(CONTENT_SECURITY_POLICY));
            }
        }

        mutations.extend(
            HOP_BY_HOP
                .iter()
                .map(|name| HeaderMutation::Remove(HeaderName::from_static(*name))),
        );

        Self { mutations }
    }

    /// Apply the policy to upstream headers in place
    pub fn apply(&self, headers: &mut HeaderMap) {
        for mutation in &self.mutations {
            mutation.apply(headers);
        }
    }

    /// Apply the policy to the headers of a re-serialized HTML body.
    ///
    /// The upstream encoding and length describe the original bytes, so they
    /// are replaced by the rewritten body's.
    pub fn apply_rewritten(&self, headers: &mut HeaderMap, body_len: usize) {
        self.apply(headers);
        headers.remove(CONTENT_ENCODING);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(REWRITTEN_HTML_CONTENT_TYPE),
        );
    }
}

impl Default for HeaderPolicy {
    fn default() -> Self {
        Self::new(FramingMode::default())
    }
}

/// Whether a response's content type names an HTML document
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::TRANSFER_ENCODING;

    fn upstream_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=iso-8859-1"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1234"));
        headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
        headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://only.test"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-upstream", HeaderValue::from_static("kept"));
        headers
    }

    #[test]
    fn test_framing_mode_default_is_restrictive() {
        assert_eq!(FramingMode::default(), FramingMode::Restrictive);
        let mut headers = HeaderMap::new();
        HeaderPolicy::default().apply(&mut headers);
        assert_eq!(headers[X_FRAME_OPTIONS], "DENY");
    }

    #[test]
    fn test_restrictive_policy() {
        let mut headers = upstream_headers();
        HeaderPolicy::new(FramingMode::Restrictive).apply(&mut headers);

        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[CONTENT_SECURITY_POLICY], "frame-ancestors 'none'");
        assert!(!headers.contains_key(TRANSFER_ENCODING));
        assert_eq!(headers["x-upstream"], "kept");
        // Passthrough keeps the upstream body description
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
        assert_eq!(headers[CONTENT_LENGTH], "1234");
    }

    #[test]
    fn test_permissive_policy() {
        let mut headers = upstream_headers();
        HeaderPolicy::new(FramingMode::Permissive).apply(&mut headers);

        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!headers.contains_key(X_FRAME_OPTIONS));
        assert!(!headers.contains_key(CONTENT_SECURITY_POLICY));
    }

    #[test]
    fn test_rewritten_body_headers() {
        let mut headers = upstream_headers();
        HeaderPolicy::default().apply_rewritten(&mut headers, 42);

        assert!(!headers.contains_key(CONTENT_ENCODING));
        assert_eq!(headers[CONTENT_LENGTH], "42");
        assert_eq!(headers[CONTENT_TYPE], REWRITTEN_HTML_CONTENT_TYPE);
    }

    #[test]
    fn test_policy_is_idempotent() {
        for framing in [FramingMode::Restrictive, FramingMode::Permissive] {
            let policy = HeaderPolicy::new(framing);
            let mut once = upstream_headers();
            policy.apply(&mut once);
            let mut twice = once.clone();
            policy.apply(&mut twice);
            assert_eq!(once, twice);

            policy.apply_rewritten(&mut twice, 10);
            let mut thrice = twice.clone();
            policy.apply_rewritten(&mut thrice, 10);
            assert_eq!(twice, thrice);
        }
    }

    #[test]
    fn test_hop_by_hop_headers_removed() {
        let mut headers = HeaderMap::new();
        for name in HOP_BY_HOP {
            headers.insert(HeaderName::from_static(*name), HeaderValue::from_static("x"));
        }
        HeaderPolicy::default().apply(&mut headers);
        for name in HOP_BY_HOP {
            assert!(!headers.contains_key(*name), "{name} should be removed");
        }
    }

    #[test]
    fn test_is_html() {
        let mut headers = HeaderMap::new();
        assert!(!is_html(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Text/HTML; charset=UTF-8"));
        assert!(is_html(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        assert!(!is_html(&headers));
    }

    #[test]
    fn test_framing_mode_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            framing: FramingMode,
        }
        let w: Wrapper = toml::from_str("framing = \"permissive\"").unwrap();
        assert_eq!(w.framing, FramingMode::Permissive);
    }
}
