//! Inline CSS rewriting: `url(...)` references and `@import "..."` strings

use crate::origin::RewriteContext;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;

static CSS_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^"'\s)][^\s)]*))\s*\)"#)
        .expect("valid CSS url regex")
});

static CSS_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("valid CSS import regex")
});

/// First non-empty capture among the alternatives of a pattern
fn captured_reference<'t>(caps: &Captures<'t>) -> Option<&'t str> {
    (1..caps.len())
        .filter_map(|i| caps.get(i))
        .map(|m| m.as_str().trim())
        .find(|s| !s.is_empty())
}

/// Rewrite every `url(...)` and `@import "..."` reference in a stylesheet.
///
/// Matches whose reference is not proxied (same origin, `data:`, unparsable)
/// are left exactly as written.
pub fn rewrite_css<'t>(css: &'t str, ctx: &RewriteContext<'_>) -> Cow<'t, str> {
    let with_urls = CSS_URL_RE.replace_all(css, |caps: &Captures| {
        let whole = caps[0].to_string();
        match captured_reference(caps).map(|reference| ctx.rewrite(reference)) {
            Some(rewrite) if rewrite.is_proxied() => format!("url({})", rewrite.or_original(&whole)),
            _ => whole,
        }
    });

    let with_imports = match CSS_IMPORT_RE.replace_all(&with_urls, |caps: &Captures| {
        let whole = caps[0].to_string();
        match captured_reference(caps).map(|reference| ctx.rewrite(reference)) {
            Some(rewrite) if rewrite.is_proxied() => {
                format!("@import \"{}\"", rewrite.or_original(&whole))
            }
            _ => whole,
        }
    }) {
        Cow::Borrowed(_) => None,
        Cow::Owned(rewritten) => Some(rewritten),
    };

    match with_imports {
        Some(rewritten) => Cow::Owned(rewritten),
        None => with_urls,
    }
}
