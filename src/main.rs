use corsgate::config::Config;
use corsgate::dispatch::Dispatcher;
use corsgate::proxy::ProxyServer;
use corsgate::upstream::UpstreamClient;
use corsgate::{PKG_NAME, VERSION};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("corsgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; a missing default file means built-in defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file found, using defaults");
        let config = Config::default();
        config.validate()?;
        config
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let origin = config.proxy_origin()?;
    let profile = config
        .request_profile()
        .map_err(|e| anyhow::anyhow!("Invalid upstream header value: {}", e))?;
    let client = UpstreamClient::new(config.client_config())?;
    let fetch_stats = client.stats();
    let dispatcher = Arc::new(
        Dispatcher::new(client, origin, config.header_policy(), profile)
            .with_max_document_bytes(config.upstream.max_document_bytes)
            .with_max_request_bytes(config.upstream.max_request_bytes),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let mut server = ProxyServer::new(addr, dispatcher, shutdown_rx);

    if let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;
        info!(cert = %cert_path, key = %key_path, "TLS enabled with provided certificates");
        server = server.with_tls(TlsAcceptor::from(Arc::new(tls_config)));
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        total_requests = fetch_stats.get_total_requests(),
        failed_requests = fetch_stats.get_failed_requests(),
        "Upstream fetch totals"
    );
    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting CORS proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        proxy_origin = %config.server.proxy_origin_str(),
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.upstream.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.upstream.pool_idle_timeout_secs,
        connect_timeout_secs = config.upstream.connect_timeout_secs,
        max_document_bytes = config.upstream.max_document_bytes,
        max_request_bytes = config.upstream.max_request_bytes,
        "Upstream settings"
    );
    info!(framing = ?config.policy.framing, "Header policy");
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}
