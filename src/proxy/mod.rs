//! Credential-holding proxy endpoint.
//!
//! A single stateless relay between the browser-less client and the
//! upstream generative API. Each request is handled independently; nothing
//! is shared across requests and nothing is persisted.
//!
//! The proxy is responsible for:
//! - Attaching the server-held credential to upstream calls
//! - Returning upstream JSON verbatim on success
//! - Converting any upstream failure into a uniform `500 {"error": ...}`
//!   carrying the upstream status, never a 200
//!
//! The proxy MUST NOT:
//! - Persist a submitted image
//! - Log the raw payload (byte lengths only)
//! - Accept a credential from the request

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::ProxySettings;
use crate::upstream::{split_data_url, UpstreamClient};

const MAX_HEADER_BYTES: usize = 8192;
/// Base64 data-URLs for camera stills are large; cap the body generously.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct ProxyServer {
    settings: ProxySettings,
    api_key: String,
}

#[derive(Debug)]
pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("proxy server thread panicked"))?;
        }
        Ok(())
    }
}

impl ProxyServer {
    pub fn new(settings: ProxySettings, api_key: String) -> Self {
        Self { settings, api_key }
    }

    pub fn spawn(self) -> Result<ProxyHandle> {
        let configured_addr: SocketAddr = self.settings.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "proxy configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let upstream = UpstreamClient::new(self.settings, self.api_key);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_proxy(listener, upstream, shutdown_thread) {
                log::error!("proxy endpoint stopped: {}", err);
            }
        });

        Ok(ProxyHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_proxy(
    listener: TcpListener,
    upstream: UpstreamClient,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &upstream) {
                    log::warn!("proxy request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, upstream: &UpstreamClient) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        }
        ("POST", "/analyze") => {
            log::info!("analyze request ({} body bytes)", request.body.len());
            let outcome = relay_analyze(&request.body, upstream);
            write_relay_outcome(&mut stream, outcome)?;
        }
        ("POST", "/explain") => {
            log::info!("explain request ({} body bytes)", request.body.len());
            let outcome = relay_explain(&request.body, upstream);
            write_relay_outcome(&mut stream, outcome)?;
        }
        ("POST", _) | ("GET", _) => {
            write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        }
        _ => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        }
    }
    Ok(())
}

fn relay_analyze(body: &[u8], upstream: &UpstreamClient) -> Result<Value, String> {
    let parsed: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid request body: {}", e))?;
    let image = parsed
        .get("image")
        .and_then(Value::as_str)
        .ok_or_else(|| "request body has no image field".to_string())?;
    let (mime, data) =
        split_data_url(image).ok_or_else(|| "image field is not a base64 payload".to_string())?;
    upstream.analyze(mime, data).map_err(|e| e.to_string())
}

fn relay_explain(body: &[u8], upstream: &UpstreamClient) -> Result<Value, String> {
    let parsed: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid request body: {}", e))?;
    let analysis = parsed
        .get("result")
        .ok_or_else(|| "request body has no result field".to_string())?;
    upstream.explain(analysis).map_err(|e| e.to_string())
}

/// Success passes the upstream body through verbatim; every failure becomes
/// a uniform 500 so the caller never mistakes a relay error for an empty
/// success.
fn write_relay_outcome(stream: &mut TcpStream, outcome: Result<Value, String>) -> Result<()> {
    match outcome {
        Ok(body) => {
            let payload = serde_json::to_vec(&body)?;
            write_response(stream, 200, "application/json", &payload)
        }
        Err(message) => {
            log::warn!("relay failed: {}", message);
            let payload = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
            write_response(stream, 500, "application/json", &payload)
        }
    }
}

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers completed"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let header_text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|v| v.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before body completed"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
