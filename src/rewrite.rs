//! HTML rewriting
//!
//! Every resource-bearing attribute, inline `style` attribute and `<style>`
//! element of a document is routed back through the proxy. Rules only see an
//! element through [`ElementAttributes`], so they can be exercised without an
//! HTML parser; [`rewrite_document`] drives them with `lol_html`.
//!
//! All references resolve against the document's target URL. `<base>`
//! elements are ignored on purpose: the rewrite context is fixed for the
//! whole pass.

use crate::css::rewrite_css;
use crate::origin::RewriteContext;
use lol_html::html_content::{ContentType, Element};
use lol_html::{doctype, element, text, HtmlRewriter, Settings};
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::Cell;

/// Prepended when the upstream document has no doctype of its own
const DEFAULT_DOCTYPE: &str = "<!DOCTYPE html>\n";

/// Reference prefixes that never name a fetchable resource
const NON_NAVIGABLE_PREFIXES: &[&str] = &["#", "mailto:", "javascript:", "tel:"];

static META_REFRESH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\d+\s*;\s*url\s*=\s*(.+)").expect("valid meta refresh regex")
});

/// Errors raised while rewriting a document
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("cannot set attribute '{0}'")]
    Attribute(String),
    #[error("failed to parse HTML: {0}")]
    Parse(String),
}

/// A whole-document rewrite pass, as used by the dispatcher
pub type DocumentRewriter = fn(&str, &RewriteContext<'_>) -> Result<Vec<u8>, RewriteError>;

/// The view of an element the rewrite rules need
pub trait ElementAttributes {
    /// Attribute value with character references decoded
    fn attribute(&self, name: &str) -> Option<String>;
    fn set(&mut self, name: &str, value: &str) -> Result<(), RewriteError>;
}

impl ElementAttributes for Element<'_, '_> {
    // lol_html hands back the source text, `&amp;` and all
    fn attribute(&self, name: &str) -> Option<String> {
        self.get_attribute(name)
            .map(|value| html_escape::decode_html_entities(&value).into_owned())
    }

    fn set(&mut self, name: &str, value: &str) -> Result<(), RewriteError> {
        self.set_attribute(name, value)
            .map_err(|_| RewriteError::Attribute(name.to_string()))
    }
}

/// How the value of a matched attribute is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// A single sub-resource URL
    Resource,
    /// A `srcset` candidate list
    Srcset,
    /// `link@href`, only for `rel=stylesheet`
    Stylesheet,
    /// A navigation target; `#`, `mailto:`, `javascript:` and `tel:` are skipped
    Navigation,
    /// `meta@content`, only for `http-equiv=refresh`
    MetaRefresh,
}

/// An element/attribute pair carrying a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRule {
    pub tag: &'static str,
    pub attribute: &'static str,
    pub kind: RuleKind,
}

const fn rule(tag: &'static str, attribute: &'static str, kind: RuleKind) -> AttributeRule {
    AttributeRule {
        tag,
        attribute,
        kind,
    }
}

/// The fixed rule set applied to every document
pub const ATTRIBUTE_RULES: &[AttributeRule] = &[
    rule("img", "src", RuleKind::Resource),
    rule("script", "src", RuleKind::Resource),
    rule("iframe", "src", RuleKind::Resource),
    rule("source", "src", RuleKind::Resource),
    rule("video", "src", RuleKind::Resource),
    rule("audio", "src", RuleKind::Resource),
    rule("img", "srcset", RuleKind::Srcset),
    rule("link", "href", RuleKind::Stylesheet),
    rule("a", "href", RuleKind::Navigation),
    rule("area", "href", RuleKind::Navigation),
    rule("form", "action", RuleKind::Navigation),
    rule("meta", "content", RuleKind::MetaRefresh),
];

impl AttributeRule {
    /// CSS selector matching elements this rule applies to
    pub fn selector(&self) -> String {
        format!("{}[{}]", self.tag, self.attribute)
    }

    /// Rewrite this rule's attribute on `element`. Missing attributes are a no-op.
    pub fn apply<E>(&self, element: &mut E, ctx: &RewriteContext<'_>) -> Result<(), RewriteError>
    where
        E: ElementAttributes + ?Sized,
    {
        let Some(value) = element.attribute(self.attribute) else {
            return Ok(());
        };
        if value.trim().is_empty() {
            return Ok(());
        }

        let rewritten = match self.kind {
            RuleKind::Resource => ctx.proxy_url(&value),
            RuleKind::Srcset => rewrite_srcset(&value, ctx),
            RuleKind::Stylesheet => {
                if !is_stylesheet_link(element) || is_non_navigable(&value) {
                    return Ok(());
                }
                ctx.proxy_url(&value)
            }
            RuleKind::Navigation => {
                if is_non_navigable(&value) {
                    return Ok(());
                }
                ctx.proxy_url(&value)
            }
            RuleKind::MetaRefresh => {
                let is_refresh = element
                    .attribute("http-equiv")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh"));
                match (is_refresh, rewrite_meta_refresh(&value, ctx)) {
                    (true, Some(content)) => content,
                    _ => return Ok(()),
                }
            }
        };

        if rewritten != value {
            element.set(self.attribute, &rewritten)?;
        }
        Ok(())
    }
}

fn is_stylesheet_link<E: ElementAttributes + ?Sized>(element: &E) -> bool {
    element.attribute("rel").is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    })
}

fn is_non_navigable(value: &str) -> bool {
    let value = value.trim_start();
    NON_NAVIGABLE_PREFIXES.iter().any(|prefix| {
        value
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Rewrite each candidate URL of a `srcset`, keeping descriptors and order
pub fn rewrite_srcset(srcset: &str, ctx: &RewriteContext<'_>) -> String {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| match candidate.split_once(char::is_whitespace) {
            Some((url, descriptor)) => format!("{} {}", ctx.proxy_url(url), descriptor.trim()),
            None => ctx.proxy_url(candidate),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `<seconds>;url=<target>` becomes `0; url=<proxied target>`.
/// Returns `None` when the content carries no target.
pub fn rewrite_meta_refresh(content: &str, ctx: &RewriteContext<'_>) -> Option<String> {
    let caps = META_REFRESH_RE.captures(content)?;
    let target = caps[1].trim().trim_matches(|c| c == '"' || c == '\'');
    if target.is_empty() {
        return None;
    }
    Some(format!("0; url={}", ctx.proxy_url(target)))
}

/// Rewrite `url(...)` references inside an inline `style` attribute
pub fn rewrite_inline_style<E>(element: &mut E, ctx: &RewriteContext<'_>) -> Result<(), RewriteError>
where
    E: ElementAttributes + ?Sized,
{
    let Some(style) = element.attribute("style") else {
        return Ok(());
    };
    let rewritten = rewrite_css(&style, ctx);
    if rewritten != style {
        element.set("style", &rewritten)?;
    }
    Ok(())
}

/// Rewrite a complete HTML document and serialize it back, doctype included.
///
/// Parse failures abort the whole pass; a half-rewritten document is never
/// returned.
pub fn rewrite_document(html: &str, ctx: &RewriteContext<'_>) -> Result<Vec<u8>, RewriteError> {
    let ctx = *ctx;
    let saw_doctype = Cell::new(false);
    let mut output = Vec::with_capacity(html.len());

    let mut element_content_handlers: Vec<_> = ATTRIBUTE_RULES
        .iter()
        .map(|rule| {
            element!(rule.selector(), move |el| {
                rule.apply(el, &ctx)?;
                Ok(())
            })
        })
        .collect();

    element_content_handlers.push(element!("*[style]", move |el| {
        rewrite_inline_style(el, &ctx)?;
        Ok(())
    }));

    // <style> text can arrive in several chunks; hold them back until the
    // last one so a url(...) split across chunks is still seen whole.
    let mut style_text = String::new();
    element_content_handlers.push(text!("style", move |chunk| {
        style_text.push_str(chunk.as_str());
        if chunk.last_in_text_node() {
            let rewritten = rewrite_css(&style_text, &ctx).into_owned();
            chunk.replace(&rewritten, ContentType::Html);
            style_text.clear();
        } else {
            chunk.remove();
        }
        Ok(())
    }));

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers,
            document_content_handlers: vec![doctype!(|_| {
                saw_doctype.set(true);
                Ok(())
            })],
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );

    rewriter
        .write(html.as_bytes())
        .and_then(|_| rewriter.end())
        .map_err(|e| RewriteError::Parse(e.to_string()))?;

    if saw_doctype.get() {
        return Ok(output);
    }
    let mut document = Vec::with_capacity(DEFAULT_DOCTYPE.len() + output.len());
    document.extend_from_slice(DEFAULT_DOCTYPE.as_bytes());
    document.extend_from_slice(&output);
    Ok(document)
}
