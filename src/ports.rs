use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

/// Ports sampled (one at random per host) by the liveness probe.
pub const LIVENESS_PORTS: &[u16] = &[80, 443, 554, 8080];

/// Candidate camera service ports, probed in this order for every live host.
pub const CAMERA_PORTS: &[u16] = &[554, 80, 8080, 8000, 8081, 81, 88, 3702, 8554, 1935];

/// Ports identified as RTSP services.
pub const RTSP_PORTS: &[u16] = &[554, 8554];

/// Ports identified as HTTP/MJPEG services.
pub const HTTP_PORTS: &[u16] = &[80, 8080, 8000, 8081, 81, 88];

const BANNER_LIMIT: usize = 4096;

/// Passive HTTP evidence collected from a `GET /`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpBanner {
    pub server: Option<String>,
    pub body: String,
}

/// TCP primitive used by the scanner.
///
/// Every call owns its connection: it is opened per attempt and dropped on
/// success, timeout or error.
#[async_trait]
pub trait Connector: Send + Sync {
    /// `true` when a TCP connect to `addr` completes within `timeout`.
    async fn is_open(&self, addr: SocketAddr, timeout: Duration) -> bool;

    /// Fetch `/` over plain HTTP and return the `Server` header plus body prefix.
    async fn http_banner(&self, addr: SocketAddr, timeout: Duration) -> Option<HttpBanner>;
}

/// Real-socket [`Connector`] backed by `tokio::net::TcpStream`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn is_open(&self, addr: SocketAddr, timeout: Duration) -> bool {
        matches!(
            time::timeout(timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn http_banner(&self, addr: SocketAddr, timeout: Duration) -> Option<HttpBanner> {
        let mut stream = match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            _ => return None,
        };
        let request = format!(
            "GET / HTTP/1.0\r\nHost: {}\r\nUser-Agent: camscan/{}\r\nConnection: close\r\n\r\n",
            addr.ip(),
            env!("CARGO_PKG_VERSION")
        );
        time::timeout(timeout, stream.write_all(request.as_bytes()))
            .await
            .ok()?
            .ok()?;
        let raw = read_bounded(&mut stream, timeout).await?;
        Some(parse_http_banner(&raw))
    }
}

/// Read up to [`BANNER_LIMIT`] bytes until EOF or `timeout`, as lossy UTF-8.
async fn read_bounded(stream: &mut TcpStream, timeout: Duration) -> Option<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let deadline = time::Instant::now() + timeout;
    while buf.len() < BANNER_LIMIT {
        match time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    if buf.is_empty() {
        return None;
    }
    buf.truncate(BANNER_LIMIT);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Split a raw HTTP response into the `Server` header and the body.
pub fn parse_http_banner(raw: &str) -> HttpBanner {
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .or_else(|| raw.split_once("\n\n"))
        .unwrap_or((raw, ""));
    let server = head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("server")
            .then(|| value.trim().to_string())
    });
    HttpBanner {
        server,
        body: body.to_string(),
    }
}
