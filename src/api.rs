//! HTTP/JSON control surface.
//!
//! A deliberately minimal HTTP/1.1 subset served on the loopback: one
//! capped read per connection, request line and query string parsed,
//! headers ignored, JSON out, `Connection: close`. UI layers and scripts
//! drive the manager through these routes; nothing else is exposed.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::manager::Manager;
use crate::state::ServerInfo;

/// Cap on the first (and only) read of a request.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

const ENCODING_FAILED: &[u8] = br#"{"error":"JSON encoding failed"}"#;

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogsResponse {
    id: String,
    lines: Vec<String>,
    total_lines: usize,
}

#[derive(Serialize)]
struct ServerList {
    servers: Vec<ServerInfo>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Binds the control listener on the loopback with local endpoint reuse.
pub fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let socket = TcpSocket::new_v4().context("failed to create control socket")?;
    socket
        .set_reuseaddr(true)
        .context("failed to set SO_REUSEADDR")?;
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind 127.0.0.1:{port}"))?;
    socket.listen(64).context("failed to listen on control socket")
}

/// Accept loop; one task per connection, until the shutdown signal fires.
pub async fn serve(listener: TcpListener, manager: Manager, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let manager = manager.clone();
                    tokio::spawn(handle_connection(stream, manager));
                }
                Err(err) => warn!("control API accept failed: {err}"),
            }
        }
    }
    debug!("control API listener stopped");
}

async fn handle_connection(mut stream: TcpStream, manager: Manager) {
    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let n = match stream.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let (status, body) = match request.lines().next().and_then(parse_request_line) {
        Some((method, path, query)) => route(&manager, method, path, query).await,
        None => encode(400, &ErrorBody {
            error: "Malformed request".to_string(),
        }),
    };
    respond(&mut stream, status, &body).await;
}

async fn respond(stream: &mut TcpStream, status: u16, body: &[u8]) {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.flush().await;
}

async fn route(manager: &Manager, method: &str, path: &str, query: &str) -> (u16, Vec<u8>) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        ("GET", ["servers"]) => encode(200, &ServerList {
            servers: manager.list_info().await,
        }),
        ("POST", ["servers", "start-all"]) => action(manager.start_all().await),
        ("POST", ["servers", "stop-all"]) => action(manager.stop_all().await),
        ("POST", ["servers", "reload-settings"]) => action(manager.reload_settings().await),
        ("GET", ["servers", id]) => match manager.get_info(id).await {
            Some(info) => encode(200, &info),
            None => not_found(),
        },
        ("GET", ["servers", id, "logs"]) => {
            match manager.get_logs(id, lines_param(query)).await {
                Some((lines, total_lines)) => encode(200, &LogsResponse {
                    id: id.to_string(),
                    lines,
                    total_lines,
                }),
                None => not_found(),
            }
        }
        ("POST", ["servers", id, verb]) => {
            if manager.get_info(id).await.is_none() {
                return not_found();
            }
            match *verb {
                "start" => action(manager.start(id).await),
                "stop" => action(manager.stop(id).await),
                "restart" => action(manager.restart(id).await),
                "clear-logs" => action(manager.clear_logs(id).await),
                _ => unknown_route(path),
            }
        }
        _ => unknown_route(path),
    }
}

/// Operation outcomes always answer 200; failures surface in the body.
fn action(result: Result<String>) -> (u16, Vec<u8>) {
    match result {
        Ok(message) => encode(200, &ActionResponse {
            success: true,
            message,
        }),
        Err(err) => encode(200, &ActionResponse {
            success: false,
            message: format!("{err:#}"),
        }),
    }
}

fn not_found() -> (u16, Vec<u8>) {
    encode(404, &ErrorBody {
        error: "Server not found".to_string(),
    })
}

fn unknown_route(path: &str) -> (u16, Vec<u8>) {
    encode(404, &ErrorBody {
        error: format!("Not found: {path}"),
    })
}

fn encode<T: Serialize>(status: u16, value: &T) -> (u16, Vec<u8>) {
    match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(_) => (500, ENCODING_FAILED.to_vec()),
    }
}

fn parse_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") || !target.starts_with('/') {
        return None;
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    Some((method, path, query))
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn lines_param(query: &str) -> usize {
    query_param(query, "lines")
        .and_then(|v| v.parse().ok())
        .unwrap_or(100)
}
