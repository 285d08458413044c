//! Integration tests for Corsgate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use corsgate::dispatch::Dispatcher;
use corsgate::origin::ProxyOrigin;
use corsgate::policy::{FramingMode, HeaderPolicy};
use corsgate::proxy::ProxyServer;
use corsgate::upstream::{ClientConfig, RequestProfile, UpstreamClient};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, LOCATION, USER_AGENT, X_FRAME_OPTIONS};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const PAGE: &str = "<html><head><link rel=\"stylesheet\" href=\"/site.css\"></head>\
<body><img src=\"/logo.png\" srcset=\"/a.png 1x, /b.png 2x\"><a href=\"#top\">top</a>\
<a href=\"/next\">next</a></body></html>";

const BLOB: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff, 0xfe];

// ============================================================================
// Helpers
// ============================================================================

/// Get a free port on the loopback interface
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn upstream_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/page" => Response::builder()
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header(X_FRAME_OPTIONS, "SAMEORIGIN")
            .body(Full::new(Bytes::from_static(PAGE.as_bytes()))),
        "/blob" => Response::builder()
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from_static(BLOB))),
        "/redirect" => Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, "/page")
            .body(Full::new(Bytes::new())),
        "/echo" => {
            let method = req.method().to_string();
            let user_agent = req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = req.into_body().collect().await.unwrap().to_bytes();
            Response::builder()
                .header(CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(format!(
                    "{}\n{}\n{}",
                    method,
                    user_agent,
                    String::from_utf8_lossy(&body)
                ))))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found"))),
    };
    Ok(response.unwrap())
}

/// Start a mock upstream site on a loopback port
async fn start_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_handler))
                    .await;
            });
        }
    });

    addr
}

/// Start a proxy on a free port; returns the port and the shutdown sender
async fn start_proxy(framing: FramingMode) -> (u16, watch::Sender<bool>) {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    let origin = ProxyOrigin::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
    let client = UpstreamClient::new(ClientConfig::default()).unwrap();
    let profile = RequestProfile::new("corsgate-it/1.0", "*/*", "en-US").unwrap();
    let dispatcher = Arc::new(Dispatcher::new(client, origin, HeaderPolicy::new(framing), profile));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(addr, dispatcher, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "proxy did not start listening"
    );
    (port, shutdown_tx)
}

fn proxied(proxy_port: u16, absolute: &str) -> String {
    format!(
        "http://127.0.0.1:{}/?url={}",
        proxy_port,
        urlencoding::encode(absolute)
    )
}

/// A parsed raw HTTP/1.1 response
struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl RawResponse {
    fn parse(raw: &[u8]) -> Self {
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has a header terminator");
        let head = String::from_utf8_lossy(&raw[..split]).to_string();
        let mut lines = head.split("\r\n");

        let status = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse().ok())
            .expect("valid status line");

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        let mut response = Self {
            status,
            headers,
            body: raw[split + 4..].to_vec(),
        };
        if response
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            response.body = decode_chunked(&response.body);
        }
        response
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let Some(line_end) = data.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&data[..line_end]).to_string();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&data[start..start + size]);
        data = &data[start + size + 2..];
    }
    out
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> RawResponse {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .unwrap();

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        port,
        body.len()
    );
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    RawResponse::parse(&raw)
}

async fn http_get(port: u16, path: &str) -> RawResponse {
    http_request(port, "GET", path, &[], b"").await
}

// ============================================================================
// Proxy Tests
// ============================================================================

#[tokio::test]
async fn test_missing_target_returns_400() {
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;

    let response = http_get(port, "/").await;
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), "Missing ?url parameter");
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
    assert_eq!(response.header("x-proxy-error"), Some("MISSING_TARGET"));
}

#[tokio::test]
async fn test_html_page_is_rewritten() {
    let upstream = start_upstream().await;
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let target = format!("http://{}/page", upstream);

    let response = http_get(port, &format!("/?url={}", urlencoding::encode(&target))).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("content-type"),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(response.header("x-frame-options"), Some("DENY"));
    assert_eq!(
        response.header("content-security-policy"),
        Some("frame-ancestors 'none'")
    );
    assert_eq!(
        response.header("content-length").map(|v| v.parse::<usize>().unwrap()),
        Some(response.body.len())
    );

    let body = response.text();
    let logo = format!("http://{}/logo.png", upstream);
    assert!(body.starts_with("<!DOCTYPE html>\n"));
    assert!(body.contains(&format!("<img src=\"{}\"", proxied(port, &logo))));
    assert!(body.contains(&format!(
        "srcset=\"{} 1x, {} 2x\"",
        proxied(port, &format!("http://{}/a.png", upstream)),
        proxied(port, &format!("http://{}/b.png", upstream))
    )));
    assert!(body.contains(&format!(
        "href=\"{}\"",
        proxied(port, &format!("http://{}/site.css", upstream))
    )));
    assert!(body.contains(&format!(
        "<a href=\"{}\">next</a>",
        proxied(port, &format!("http://{}/next", upstream))
    )));
    assert!(body.contains("<a href=\"#top\">top</a>"));
}

#[tokio::test]
async fn test_binary_body_passes_through_unchanged() {
    let upstream = start_upstream().await;
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let target = format!("http://{}/blob", upstream);

    let response = http_get(port, &format!("/?url={}", urlencoding::encode(&target))).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("content-type"),
        Some("application/octet-stream")
    );
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
    assert_eq!(response.body, BLOB);
}

#[tokio::test]
async fn test_redirect_returned_unfollowed() {
    let upstream = start_upstream().await;
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let target = format!("http://{}/redirect", upstream);

    let response = http_get(port, &format!("/?url={}", urlencoding::encode(&target))).await;
    assert_eq!(response.status, 302);
    assert_eq!(response.header("location"), Some("/page"));
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
}

#[tokio::test]
async fn test_upstream_status_mirrored() {
    let upstream = start_upstream().await;
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let target = format!("http://{}/nowhere", upstream);

    let response = http_get(port, &format!("/?url={}", urlencoding::encode(&target))).await;
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "not found");
}

#[tokio::test]
async fn test_method_body_and_profile_forwarded() {
    let upstream = start_upstream().await;
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let target = format!("http://{}/echo", upstream);

    let response = http_request(
        port,
        "POST",
        &format!("/?url={}", urlencoding::encode(&target)),
        &[("User-Agent", "curl/8.0"), ("Content-Type", "application/x-www-form-urlencoded")],
        b"hello=world",
    )
    .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "POST\ncorsgate-it/1.0\nhello=world");
}

#[tokio::test]
async fn test_loop_detected_returns_508() {
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let looped = format!("http://127.0.0.1:{}/?url=http://x.com", port);

    let response = http_get(port, &format!("/?url={}", urlencoding::encode(&looped))).await;
    assert_eq!(response.status, 508);
    assert_eq!(response.header("x-proxy-error"), Some("LOOP_DETECTED"));
    assert!(response.text().starts_with("Proxy loop detected"));
}

#[tokio::test]
async fn test_unreachable_upstream_returns_500() {
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;
    let closed = free_port();

    let response = http_get(port, &format!("/?url=http://127.0.0.1:{}/", closed)).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.header("x-proxy-error"), Some("UPSTREAM_FETCH_FAILED"));
    assert!(response.text().starts_with("Proxy error: "));
}

#[tokio::test]
async fn test_permissive_framing() {
    let upstream = start_upstream().await;
    let (port, _shutdown) = start_proxy(FramingMode::Permissive).await;
    let target = format!("http://{}/page", upstream);

    let response = http_get(port, &format!("/?url={}", urlencoding::encode(&target))).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("x-frame-options"), None);
    assert_eq!(response.header("content-security-policy"), None);
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
}

#[tokio::test]
async fn test_request_id_round_trip() {
    let (port, _shutdown) = start_proxy(FramingMode::Restrictive).await;

    let response = http_request(port, "GET", "/", &[("X-Request-Id", "it-42")], b"").await;
    assert_eq!(response.header("x-request-id"), Some("it-42"));

    let response = http_get(port, "/").await;
    let generated = response.header("x-request-id").unwrap();
    assert!(uuid::Uuid::parse_str(generated).is_ok());
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let (port, shutdown) = start_proxy(FramingMode::Restrictive).await;

    shutdown.send(true).unwrap();

    let mut closed = false;
    for _ in 0..50 {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).await.is_err() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(closed, "listener still accepting after shutdown");
}
