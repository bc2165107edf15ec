use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::EventError;
use crate::events::{SIGNATURE_HEADER, SystemEventService, TIMESTAMP_HEADER};
use crate::health::HealthChecker;

/// Largest request (head plus body) the server reads.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

const EVENTS_PREFIX: &str = "/stats_collector/v0/validator/";
const EVENTS_SUFFIX: &str = "/system_events";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parse a request whose head is complete. The body is whatever follows
    /// the head.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let head_end = find_head_end(raw)?;
        let head = std::str::from_utf8(&raw[..head_end]).ok()?;
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let path = request_line.next()?.to_string();
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();
        Some(Self { method, path, headers, body: raw[head_end + 4..].to_vec() })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> usize {
        self.header("Content-Length").and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug)]
enum ReadError {
    Closed,
    Malformed,
    TooLarge,
}

/// Read one request: the head, then `Content-Length` bytes of body.
async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HttpRequest, ReadError> {
    let mut raw = Vec::with_capacity(1024);
    let mut buffer = [0u8; 4096];
    loop {
        if let Some(head_end) = find_head_end(&raw) {
            let request = HttpRequest::parse(&raw).ok_or(ReadError::Malformed)?;
            let total = head_end + 4 + request.content_length();
            if total > MAX_REQUEST_BYTES {
                return Err(ReadError::TooLarge);
            }
            if raw.len() >= total {
                raw.truncate(total);
                return HttpRequest::parse(&raw).ok_or(ReadError::Malformed);
            }
        } else if raw.len() > MAX_REQUEST_BYTES {
            return Err(ReadError::TooLarge);
        }

        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) if raw.is_empty() => return Err(ReadError::Closed),
            Ok(0) | Err(_) => return Err(ReadError::Malformed),
            Ok(n) => raw.extend_from_slice(&buffer[..n]),
        }
    }
}

pub struct HealthServer {
    health_checker: Arc<HealthChecker>,
    events: Option<Arc<SystemEventService>>,
    port: u16,
}

impl HealthServer {
    pub fn new(health_checker: Arc<HealthChecker>, port: u16) -> Self {
        Self { health_checker, events: None, port }
    }

    /// Also accept validator system events.
    pub fn with_events(mut self, events: Arc<SystemEventService>) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn start(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(port = self.port, "health server listening");
        self.serve(listener).await
    }

    /// Serve requests on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (mut socket, peer) = listener.accept().await?;
            let health_checker = Arc::clone(&self.health_checker);
            let events = self.events.clone();

            tokio::spawn(async move {
                let response = match read_request(&mut socket).await {
                    Ok(request) => Self::handle_request(&request, &health_checker, events.as_deref()).await,
                    Err(ReadError::Closed) => return,
                    Err(ReadError::TooLarge) => Self::error_response(413, "Payload Too Large"),
                    Err(ReadError::Malformed) => Self::error_response(400, "Bad Request"),
                };

                if let Err(e) = socket.write_all(response.as_bytes()).await {
                    debug!(%peer, error = %e, "failed to write health response");
                }
            });
        }
    }

    async fn handle_request(
        request: &HttpRequest,
        health_checker: &HealthChecker,
        events: Option<&SystemEventService>,
    ) -> String {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/health") => {
                let status = if health_checker.is_healthy() { 200 } else { 503 };
                match serde_json::to_string(&health_checker.get_health()) {
                    Ok(json) => Self::response(status, "application/json", &json),
                    Err(_) => Self::error_response(500, "Internal Server Error"),
                }
            }
            ("GET", "/status") => match serde_json::to_string(&health_checker.get_detailed_status()) {
                Ok(json) => Self::response(200, "application/json", &json),
                Err(_) => Self::error_response(500, "Internal Server Error"),
            },
            ("GET", "/metrics") => match health_checker.prometheus_text() {
                Ok(text) => Self::response(200, "text/plain; version=0.0.4", &text),
                Err(_) => Self::error_response(500, "Internal Server Error"),
            },
            ("POST", path) => match (events, events_address(path)) {
                (Some(events), Some(address)) => Self::post_events(request, address, events).await,
                _ => Self::error_response(404, "Not Found"),
            },
            _ => Self::error_response(404, "Not Found"),
        }
    }

    async fn post_events(request: &HttpRequest, address: &str, events: &SystemEventService) -> String {
        let result = events
            .record(address, request.header(TIMESTAMP_HEADER), request.header(SIGNATURE_HEADER), &request.body)
            .await;
        match result {
            Ok(stored) => match serde_json::to_string(&stored) {
                Ok(json) => Self::response(201, "application/json", &json),
                Err(_) => Self::error_response(500, "Internal Server Error"),
            },
            Err(EventError::Unauthenticated(e)) => {
                debug!(validator = %address, reason = %e, "system events refused");
                Self::detail_response(401, &e.to_string())
            }
            Err(EventError::Invalid(msg)) => Self::detail_response(400, &msg),
            Err(EventError::Persistence(e)) => {
                warn!(validator = %address, error = %e, "failed to store system events");
                Self::error_response(500, "Internal Server Error")
            }
        }
    }

    fn reason(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            413 => "Payload Too Large",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    fn response(status: u16, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            Self::reason(status),
            content_type,
            body.len(),
            body
        )
    }

    fn error_response(status: u16, message: &str) -> String {
        let body = serde_json::json!({ "error": message }).to_string();
        Self::response(status, "application/json", &body)
    }

    fn detail_response(status: u16, detail: &str) -> String {
        let body = serde_json::json!({ "detail": detail }).to_string();
        Self::response(status, "application/json", &body)
    }
}

/// Validator address of a system events path.
fn events_address(path: &str) -> Option<&str> {
    path.strip_prefix(EVENTS_PREFIX)?
        .strip_suffix(EVENTS_SUFFIX)
        .filter(|address| !address.is_empty() && !address.contains('/'))
}
