//! [`CockpitServer`] – HTTP + WebSocket front door of the bridge.
//!
//! Serves whatever listener the bridge hands to [`CockpitServer::serve`].
//!
//! * WebSocket upgrade on the viewer path (`/ws`) → [`serve_viewer`].
//! * `POST /api/contact` → logs the submitted contact form.
//! * Any other `GET` → file from the static directory, with an embedded
//!   dashboard standing in for a missing `index.html`.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use voltbridge_middleware::shutdown::{self, ShutdownSignal};
use voltbridge_types::BridgeError;

use crate::bridge::{ViewerLink, serve_viewer};

/// Default TCP port for the HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 5177;

/// Default path viewers upgrade on.
pub const DEFAULT_WS_PATH: &str = "/ws";

pub const CONTACT_PATH: &str = "/api/contact";

const INDEX_FILE: &str = "index.html";

/// Served at `/` when the static directory has no `index.html`.
const DASHBOARD_HTML: &str = include_str!("dashboard.html");

const PEEK_BYTES: usize = 2048;
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// HTTP + WebSocket server for viewers and the static dashboard.
pub struct CockpitServer {
    viewers: ViewerLink,
    ws_path: String,
    static_dir: PathBuf,
}

impl CockpitServer {
    /// Create a server handing viewer sockets to `viewers` on
    /// [`DEFAULT_WS_PATH`].
    pub fn new(viewers: ViewerLink) -> Self {
        Self {
            viewers,
            ws_path: DEFAULT_WS_PATH.to_string(),
            static_dir: PathBuf::from("./static"),
        }
    }

    pub fn with_ws_path(mut self, ws_path: impl Into<String>) -> Self {
        self.ws_path = ws_path.into();
        self
    }

    pub fn with_static_dir(mut self, static_dir: impl Into<PathBuf>) -> Self {
        self.static_dir = static_dir.into();
        self
    }

    /// Accept connections on `listener` until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, mut shutdown: ShutdownSignal) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, ws_path = %self.ws_path, "http server listening");
        }
        let server = Arc::new(self);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer, shutdown).await {
                                debug!(%peer, error = %e, "http connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "http accept error"),
                },
                _ = shutdown::requested(&mut shutdown) => break,
            }
        }
        info!("http server stopped");
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        shutdown: ShutdownSignal,
    ) -> Result<(), BridgeError> {
        // `peek` leaves the request in the socket for tungstenite's handshake.
        let mut buf = [0u8; PEEK_BYTES];
        let n = stream
            .peek(&mut buf)
            .await
            .map_err(|e| BridgeError::Transport(format!("peek error from {peer}: {e}")))?;
        let preview = String::from_utf8_lossy(&buf[..n]);

        if is_websocket_upgrade(&preview) && request_path(&preview) == Some(self.ws_path.as_str()) {
            let ws = accept_async(stream).await.map_err(|e| {
                BridgeError::Transport(format!("websocket handshake from {peer}: {e}"))
            })?;
            serve_viewer(ws, peer, self.viewers.clone(), shutdown).await;
            return Ok(());
        }

        let request = match read_request(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                let response = HttpResponse::text(400, "Bad Request");
                write_response(&mut stream, &response, false).await?;
                return Err(e);
            }
        };
        debug!(%peer, method = %request.method, path = %request.path, "http request");
        let response = self.route(&request).await;
        write_response(&mut stream, &response, request.method == "HEAD").await
    }

    async fn route(&self, request: &HttpRequest) -> HttpResponse {
        match (request.method.as_str(), request.path.as_str()) {
            ("POST", CONTACT_PATH) => handle_contact(&request.body),
            (_, CONTACT_PATH) => HttpResponse::text(405, "Method Not Allowed"),
            ("GET" | "HEAD", path) => self.serve_static(path).await,
            _ => HttpResponse::text(405, "Method Not Allowed"),
        }
    }

    async fn serve_static(&self, path: &str) -> HttpResponse {
        let Some(relative) = static_relative_path(path) else {
            warn!(path, "rejected static path");
            return HttpResponse::text(404, "Not Found");
        };
        let file = self.static_dir.join(&relative);
        match tokio::fs::read(&file).await {
            Ok(body) => HttpResponse::new(200, content_type_for(&file), body),
            Err(_) if relative == Path::new(INDEX_FILE) => {
                HttpResponse::new(200, "text/html; charset=utf-8", DASHBOARD_HTML.into())
            }
            Err(e) => {
                debug!(file = %file.display(), error = %e, "static file not served");
                HttpResponse::text(404, "Not Found")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Contact form
// ---------------------------------------------------------------------------

/// Body of `POST /api/contact`. Missing fields are empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContactForm {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub subject: String,
    pub message: String,
}

fn handle_contact(body: &[u8]) -> HttpResponse {
    match serde_json::from_slice::<ContactForm>(body) {
        Ok(form) => {
            info!(
                name = %form.name,
                email = %form.email,
                phone = %form.phone,
                company = %form.company,
                subject = %form.subject,
                message_len = form.message.len(),
                "contact form submitted"
            );
            HttpResponse::new(
                200,
                "application/json",
                json!({ "status": "success" }).to_string().into_bytes(),
            )
        }
        Err(e) => {
            warn!(error = %e, "invalid contact form");
            HttpResponse::text(400, "Invalid JSON")
        }
    }
}

// ---------------------------------------------------------------------------
// Minimal HTTP/1.1
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    /// Request target without query or fragment.
    path: String,
    body: Vec<u8>,
}

#[derive(Debug)]
struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl HttpResponse {
    fn new(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body.as_bytes().to_vec())
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

fn is_websocket_upgrade(head: &str) -> bool {
    head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

/// Path of the request line, without query or fragment.
fn request_path(head: &str) -> Option<&str> {
    let target = head.lines().next()?.split_whitespace().nth(1)?;
    target.split(['?', '#']).next()
}

async fn read_request<R>(reader: &mut R) -> Result<HttpRequest, BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(BridgeError::Decode("request header too large".into()));
        }
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(BridgeError::Decode("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| BridgeError::Decode("request header is not UTF-8".into()))?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let (Some(method), Some(target)) = (request_line.next(), request_line.next()) else {
        return Err(BridgeError::Decode("malformed request line".into()));
    };
    let path = target.split(['?', '#']).next().unwrap_or(target).to_string();
    let method = method.to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(BridgeError::Decode(format!(
            "request body of {content_length} bytes exceeds {MAX_BODY_BYTES}"
        )));
    }

    let mut body = buf[header_end + 4..].to_vec();
    if body.len() < content_length {
        let mut rest = vec![0u8; content_length - body.len()];
        reader
            .read_exact(&mut rest)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        body.extend_from_slice(&rest);
    }
    body.truncate(content_length);

    Ok(HttpRequest { method, path, body })
}

async fn write_response<W>(
    writer: &mut W,
    response: &HttpResponse,
    head_only: bool,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len(),
    );
    let mut out = header.into_bytes();
    if !head_only {
        out.extend_from_slice(&response.body);
    }
    writer
        .write_all(&out)
        .await
        .map_err(|e| BridgeError::Transport(format!("HTTP write error: {e}")))?;
    writer
        .shutdown()
        .await
        .map_err(|e| BridgeError::Transport(format!("HTTP write error: {e}")))
}

// ---------------------------------------------------------------------------
// Static files
// ---------------------------------------------------------------------------

/// Map a URL path onto a path under the static directory.
///
/// `/` and directory paths resolve to `index.html`. Returns `None` for any
/// path that could escape the directory.
fn static_relative_path(url_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in url_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            s if s.contains('\\') => return None,
            s => relative.push(s),
        }
    }
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    if relative.as_os_str().is_empty() || url_path.ends_with('/') {
        relative.push(INDEX_FILE);
    }
    Some(relative)
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
