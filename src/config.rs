use crate::dispatch::{DEFAULT_MAX_DOCUMENT_BYTES, DEFAULT_MAX_REQUEST_BYTES};
use crate::origin::ProxyOrigin;
use crate::policy::{FramingMode, HeaderPolicy};
use crate::upstream::{ClientConfig, RequestProfile};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How the proxy talks to target sites
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Response header policy
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public origin of this proxy, used in every rewritten link and for
    /// loop detection (default: http://localhost:<port>)
    pub proxy_origin: Option<String>,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// The configured proxy origin, or the local default for this port
    pub fn proxy_origin_str(&self) -> String {
        self.proxy_origin
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            proxy_origin: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// User-Agent presented to target sites
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Accept header presented to target sites
    #[serde(default = "default_accept")]
    pub accept: String,

    /// Accept-Language header presented to target sites
    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Connect timeout in seconds (default: none)
    pub connect_timeout_secs: Option<u64>,

    /// Route upstream fetches through the proxy named in the environment
    #[serde(default)]
    pub system_proxy: bool,

    /// Largest HTML document buffered for rewriting (default: 10 MiB)
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,

    /// Largest inbound request body forwarded upstream (default: 10 MiB)
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            accept: default_accept(),
            accept_language: default_accept_language(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            connect_timeout_secs: None,
            system_proxy: false,
            max_document_bytes: default_max_document_bytes(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Whether proxied pages may be framed (default: restrictive)
    #[serde(default)]
    pub framing: FramingMode,
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36".to_string()
}

fn default_accept() -> String {
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string()
}

fn default_accept_language() -> String {
    "en-US,en;q=0.9".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_max_document_bytes() -> usize {
    DEFAULT_MAX_DOCUMENT_BYTES
}

fn default_max_request_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BYTES
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.proxy_origin() {
            errors.push(e.to_string());
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("tls_cert and tls_key must be set together".to_string());
        }

        if self.upstream.max_document_bytes == 0 {
            errors.push("max_document_bytes must be greater than 0".to_string());
        }

        if self.upstream.max_request_bytes == 0 {
            errors.push("max_request_bytes must be greater than 0".to_string());
        }

        if let Err(e) = self.request_profile() {
            errors.push(format!("invalid upstream header value: {}", e));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn proxy_origin(&self) -> Result<ProxyOrigin, crate::origin::OriginError> {
        ProxyOrigin::parse(&self.server.proxy_origin_str())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_idle_per_host: self.upstream.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.upstream.pool_idle_timeout_secs),
            connect_timeout: self.upstream.connect_timeout_secs.map(Duration::from_secs),
            use_system_proxy: self.upstream.system_proxy,
        }
    }

    pub fn request_profile(&self) -> Result<RequestProfile, hyper::header::InvalidHeaderValue> {
        RequestProfile::new(
            &self.upstream.user_agent,
            &self.upstream.accept,
            &self.upstream.accept_language,
        )
    }

    pub fn header_policy(&self) -> HeaderPolicy {
        HeaderPolicy::new(self.policy.framing)
    }
}
