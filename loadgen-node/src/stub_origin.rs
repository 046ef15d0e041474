//! Scripted HTTP origin for smoke runs and integration tests
//!
//! Answers every request with the next status from a cycling script and a
//! small JSON body, one request per connection.

use crate::error::{LoadgenError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_REQUEST_BYTES: usize = 1 << 20;
const DEFAULT_RECORD_LIMIT: usize = 1024;

/// Stub settings, usually read from `STUB_*` variables
#[derive(Debug, Clone, PartialEq)]
pub struct StubConfig {
    pub listen_addr: SocketAddr,
    /// Cycled per request; never empty
    pub statuses: Vec<u16>,
    pub delay: Duration,
    /// Requests kept for inspection; later ones are counted only
    pub record_limit: usize,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            statuses: vec![200],
            delay: Duration::ZERO,
            record_limit: DEFAULT_RECORD_LIMIT,
        }
    }
}

impl StubConfig {
    /// `STUB_ADDR`, `STUB_STATUSES=200,500,...`, `STUB_DELAY_MS`, `STUB_RECORD_LIMIT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("STUB_ADDR") {
            config.listen_addr = addr
                .trim()
                .parse()
                .map_err(|e| LoadgenError::Config(format!("Invalid STUB_ADDR: {}", e)))?;
        }
        if let Some(raw) = lookup("STUB_STATUSES") {
            config.statuses = parse_statuses(&raw)?;
        }
        if let Some(raw) = lookup("STUB_DELAY_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| LoadgenError::Config(format!("Invalid STUB_DELAY_MS: {}", e)))?;
            config.delay = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("STUB_RECORD_LIMIT") {
            config.record_limit = raw.trim().parse().map_err(|e| {
                LoadgenError::Config(format!("Invalid STUB_RECORD_LIMIT: {}", e))
            })?;
        }
        Ok(config)
    }
}

/// Parse `200,500, 503` into statuses
pub fn parse_statuses(raw: &str) -> Result<Vec<u16>> {
    let statuses = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .ok()
                .filter(|code| (100..=599).contains(code))
                .ok_or_else(|| LoadgenError::Config(format!("Invalid status '{}'", s)))
        })
        .collect::<Result<Vec<_>>>()?;

    if statuses.is_empty() {
        return Err(LoadgenError::Config("STUB_STATUSES is empty".to_string()));
    }
    Ok(statuses)
}

/// What the stub saw for one request
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct StubState {
    statuses: Vec<u16>,
    delay: Duration,
    served: AtomicU64,
    record_limit: usize,
    recorded: Mutex<Vec<RecordedRequest>>,
}

impl StubState {
    fn next_status(&self) -> (u64, u16) {
        let n = self.served.fetch_add(1, Ordering::SeqCst);
        let status = self.statuses[(n % self.statuses.len() as u64) as usize];
        (n + 1, status)
    }
}

pub struct StubOrigin {
    listener: TcpListener,
    state: Arc<StubState>,
}

impl StubOrigin {
    pub async fn bind(config: StubConfig) -> Result<Self> {
        let statuses = if config.statuses.is_empty() {
            vec![200]
        } else {
            config.statuses
        };
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(StubState {
                statuses,
                delay: config.delay,
                served: AtomicU64::new(0),
                record_limit: config.record_limit,
                recorded: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve in the background until the handle is shut down or dropped
    pub fn spawn(self) -> Result<StubHandle> {
        let addr = self.local_addr()?;
        let state = Arc::clone(&self.state);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.serve(shutdown.clone()));
        Ok(StubHandle {
            addr,
            state,
            shutdown,
            task: Some(task),
        })
    }

    pub async fn serve(self, shutdown: CancellationToken) {
        info!(
            listen_addr = ?self.listener.local_addr().ok(),
            statuses = ?self.state.statuses,
            delay = ?self.state.delay,
            "Stub origin started"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, client_addr)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &state).await {
                            warn!(client_addr = %client_addr, error = %e, "Stub: failed to handle request");
                        }
                    });
                }
                Err(e) => error!(error = %e, "Stub: failed to accept connection"),
            }
        }
        debug!("Stub origin stopped");
    }
}

/// Running stub; dropping it stops the accept loop
pub struct StubHandle {
    addr: SocketAddr,
    state: Arc<StubState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StubHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn request_count(&self) -> u64 {
        self.state.served.load(Ordering::SeqCst)
    }

    /// The first `record_limit` requests, in arrival order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StubHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_connection(mut stream: TcpStream, state: &StubState) -> Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };

    let (n, status) = state.next_status();
    debug!(request = n, method = %request.method, path = %request.path, status, "Stub: request");
    if let Ok(mut recorded) = state.recorded.lock() {
        if recorded.len() < state.record_limit {
            recorded.push(request);
        }
    }

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let body = if (200..300).contains(&status) {
        format!("{{\"status\":\"ok\",\"request\":{}}}", n)
    } else {
        format!("{{\"error\":\"scripted failure\",\"status\":{},\"request\":{}}}", status, n)
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Server: StubOrigin/1.0\r\n\
         \r\n\
         {}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Read one request: head up to the blank line, then `Content-Length` bytes
async fn read_request(stream: &mut TcpStream) -> Result<Option<RecordedRequest>> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_subslice(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(LoadgenError::Other("request head too large".to_string()));
        }
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0)
        .min(MAX_REQUEST_BYTES);

    let body_start = head_end + 4;
    while buffer.len() < body_start + content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    let body_end = buffer.len().min(body_start + content_length);
    let body = String::from_utf8_lossy(&buffer[body_start..body_end]).to_string();

    Ok(Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    }))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statuses() {
        assert_eq!(parse_statuses("200, 500,503").unwrap(), vec![200, 500, 503]);
        assert!(parse_statuses("").is_err());
        assert!(parse_statuses("200,abc").is_err());
        assert!(parse_statuses("99").is_err());
    }

    #[test]
    fn test_config_from_lookup() {
        let config = StubConfig::from_lookup(|name| match name {
            "STUB_ADDR" => Some("127.0.0.1:0".to_string()),
            "STUB_STATUSES" => Some("503,200".to_string()),
            "STUB_DELAY_MS" => Some("15".to_string()),
            "STUB_RECORD_LIMIT" => Some("8".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.statuses, vec![503, 200]);
        assert_eq!(config.delay, Duration::from_millis(15));
        assert_eq!(config.record_limit, 8);
        assert_eq!(StubConfig::default().record_limit, DEFAULT_RECORD_LIMIT);

        assert!(StubConfig::from_lookup(|_| Some("nope".to_string())).is_err());
    }

    #[tokio::test]
    async fn test_scripted_statuses_cycle() {
        let stub = StubOrigin::bind(StubConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            statuses: vec![500, 201],
            ..StubConfig::default()
        })
        .await
        .unwrap()
        .spawn()
        .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut stream = TcpStream::connect(stub.addr()).await.unwrap();
            stream
                .write_all(b"POST /markdown HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            seen.push(response);
        }

        assert!(seen[0].starts_with("HTTP/1.1 500"));
        assert!(seen[1].starts_with("HTTP/1.1 201"));
        assert!(seen[2].starts_with("HTTP/1.1 500"));
        assert_eq!(stub.request_count(), 3);

        let requests = stub.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/markdown");
        assert_eq!(requests[0].body, "{}");
        assert_eq!(requests[0].header("host"), Some("x"));

        stub.shutdown().await;
    }

    async fn post(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let raw = format!("POST {} HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{{}}", path);
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_recording_stops_at_limit() {
        let stub = StubOrigin::bind(StubConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            record_limit: 2,
            ..StubConfig::default()
        })
        .await
        .unwrap()
        .spawn()
        .unwrap();

        for i in 0..5 {
            let response = post(stub.addr(), &format!("/markdown/{}", i)).await;
            assert!(response.starts_with("HTTP/1.1 200"));
        }

        assert_eq!(stub.request_count(), 5);
        let paths: Vec<_> = stub.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/markdown/0", "/markdown/1"]);

        stub.shutdown().await;
    }
}
