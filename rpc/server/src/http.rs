//! HTTP entry point: CONNECT tunneling and the debug page.
//!
//! The RPC protocol can ride an HTTP CONNECT upgrade so it passes through
//! infrastructure that only forwards HTTP. The server reads one request
//! head from the raw stream; a `CONNECT` to the RPC path is answered with a
//! fixed status line and the same stream then carries the normal framed
//! protocol. This path is not built on an HTTP framework: it has to hand
//! the raw byte stream over to the codec after the upgrade.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::{Server, metrics};

pub use protocol_wire::{CONNECTED_STATUS, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};

/// Request heads larger than this are rejected.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

impl Server {
    /// Accept connections and serve the HTTP entry point on each.
    pub async fn serve_http(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, rpc_path = DEFAULT_RPC_PATH, "rpc http listening"),
            Err(_) => info!("rpc http listening"),
        }
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        metrics::CONNECTIONS_ACTIVE.increment();
                        if let Err(err) = server.serve_http_conn(stream).await {
                            debug!(%err, "http connection error");
                        }
                        metrics::CONNECTIONS_ACTIVE.decrement();
                    });
                }
                Err(err) => {
                    error!(%err, "accept error");
                    return;
                }
            }
        }
    }

    async fn serve_http_conn(self: Arc<Self>, mut stream: TcpStream) -> std::io::Result<()> {
        // Read the head unbuffered: the bytes after it belong to the framed
        // protocol and must stay in the socket until the tunnel is up.
        let head = read_request_head(&mut stream).await?;
        let Some((method, path)) = parse_request_line(&head) else {
            warn!("unparsable http request head");
            return write_status(&mut stream, "405 Method Not Allowed", "405 must CONNECT\n")
                .await;
        };

        match (method.as_str(), path.as_str()) {
            ("CONNECT", _) => {
                stream
                    .write_all(format!("HTTP/1.0 {CONNECTED_STATUS}\n\n").as_bytes())
                    .await?;
                // The tunnel is up; hand the stream to the framed protocol.
                self.serve_conn(stream).await;
                Ok(())
            }
            ("GET", p) if p == DEFAULT_DEBUG_PATH => {
                let body = self.debug_page();
                write_status(&mut stream, "200 OK", &body).await
            }
            _ => write_status(&mut stream, "405 Method Not Allowed", "405 must CONNECT\n").await,
        }
    }

    /// Plain-text listing of services, methods, and call counts.
    fn debug_page(&self) -> String {
        let mut page = String::from("ember rpc services\n\n");
        for service in self.services() {
            page.push_str(service.name());
            page.push('\n');
            for (method, calls) in service.method_stats() {
                page.push_str(&format!("  {method}: {calls} calls\n"));
            }
        }
        page
    }
}

/// Read until the blank line ending the request head, one byte at a time so
/// nothing past the head is consumed.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") && !head.ends_with(b"\n\n") {
        if head.len() >= MAX_REQUEST_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Extract `(method, path)` from the request line.
fn parse_request_line(head: &str) -> Option<(String, String)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    Some((method, path))
}

async fn write_status(
    stream: &mut TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parses_method_and_path() {
        let head = "CONNECT /_ember_rpc_ HTTP/1.0\r\n\r\n";
        assert_eq!(
            parse_request_line(head),
            Some(("CONNECT".to_string(), "/_ember_rpc_".to_string()))
        );
    }

    #[test]
    fn garbage_request_line_is_rejected() {
        assert_eq!(parse_request_line("\r\n\r\n"), None);
    }
}
