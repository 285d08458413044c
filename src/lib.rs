//! Corsgate - a single-hop rewriting CORS proxy
//!
//! This library provides an HTTP proxy that:
//! - Fetches the page named by `?url=` (or a DuckDuckGo search built from `?q=`)
//! - Rewrites every resource reference in returned HTML back through the proxy
//! - Streams non-HTML bodies through untouched
//! - Applies a fixed CORS and framing header policy to every response
//! - Refuses targets that point back at the proxy itself

pub mod config;
pub mod css;
pub mod dispatch;
pub mod error;
pub mod origin;
pub mod policy;
pub mod proxy;
pub mod rewrite;
pub mod target;
pub mod upstream;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
