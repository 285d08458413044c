//! Target resolution from the inbound query string
//!
//! Every parameter the proxy understands travels in the query string:
//! `url` names the target directly, while `q` (with `t`, `ia`, `iax`)
//! builds a DuckDuckGo search target when no `url` is given.

use url::form_urlencoded;

/// Search engine used when only `q` is supplied
const SEARCH_ENDPOINT: &str = "https://duckduckgo.com/";

/// Default value for the DuckDuckGo `t` (source) parameter
const DEFAULT_SEARCH_SOURCE: &str = "h_";

/// Parameters recognised in the proxy's query string
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TargetQuery {
    pub url: Option<String>,
    pub q: Option<String>,
    pub t: Option<String>,
    pub ia: Option<String>,
    pub iax: Option<String>,
}

impl TargetQuery {
    /// Parse a raw (still percent-encoded) query string.
    ///
    /// The first occurrence of a parameter wins; empty values count as absent.
    pub fn parse(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "url" => &mut params.url,
                "q" => &mut params.q,
                "t" => &mut params.t,
                "ia" => &mut params.ia,
                "iax" => &mut params.iax,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        params
    }

    /// The raw target: `url` if present, otherwise a search URL built from `q`
    pub fn raw_target(&self) -> Option<String> {
        self.url.clone().or_else(|| build_search_url(self))
    }
}

/// Build a DuckDuckGo search URL, or `None` when there is no `q`
pub fn build_search_url(params: &TargetQuery) -> Option<String> {
    let q = params.q.as_deref()?;
    let t = params.t.as_deref().unwrap_or(DEFAULT_SEARCH_SOURCE);

    let mut url = format!(
        "{}?q={}&t={}",
        SEARCH_ENDPOINT,
        urlencoding::encode(q),
        urlencoding::encode(t)
    );
    if let Some(ia) = params.ia.as_deref() {
        url.push_str("&ia=");
        url.push_str(&urlencoding::encode(ia));
    }
    if let Some(iax) = params.iax.as_deref() {
        url.push_str("&iax=");
        url.push_str(&urlencoding::encode(iax));
    }

    Some(url)
}

/// Coerce a possibly scheme-less string into something that should parse as
/// an absolute URL. No parsing happens here; callers parse the result.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();

    if trimmed.starts_with("//") {
        return format!("https:{}", trimmed);
    }
    if has_scheme_prefix(trimmed) {
        return trimmed.to_string();
    }
    format!("https://{}", trimmed)
}

/// `^[a-zA-Z]+://`
fn has_scheme_prefix(s: &str) -> bool {
    let letters = s.bytes().take_while(u8::is_ascii_alphabetic).count();
    letters > 0 && s[letters..].starts_with("://")
}
