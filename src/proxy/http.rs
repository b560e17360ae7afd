//! HTTP proxy front-end.
//!
//! Handles CONNECT tunneling for TLS-bound clients, and passes plain
//! absolute-form requests through to the dialed origin with the request line
//! rewritten to origin-form. No response parsing: once the outbound leg is
//! up, bytes flow through the duplex forwarder.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::dialer::{DialError, Dialer};

use super::{bind_loopback, forward_duplex, Proxy, ProxyError, SharedDialer};

/// Upper bound on the request head we are willing to buffer.
const MAX_HEAD: usize = 16 * 1024;

/// HTTP proxy front-end.
pub struct HttpProxy {
    port: u16,
    dialer: SharedDialer,
}

impl HttpProxy {
    /// Binds `127.0.0.1:port` (0 for ephemeral) and starts accepting.
    pub async fn start(port: u16, dialer: Arc<dyn Dialer>) -> Result<Self, ProxyError> {
        let (listener, port) = bind_loopback(port).await?;
        let dialer: SharedDialer = Arc::new(RwLock::new(dialer));
        debug!("http proxy listening on 127.0.0.1:{port}");

        let shared = Arc::clone(&dialer);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let dialer = Arc::clone(&*shared.read());
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(dialer, stream).await {
                                warn!("http proxy connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("http proxy accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self { port, dialer })
    }
}

impl Proxy for HttpProxy {
    fn port(&self) -> u16 {
        self.port
    }

    fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = dialer;
    }
}

async fn handle_connection(
    dialer: Arc<dyn Dialer>,
    mut stream: TcpStream,
) -> Result<(), DialError> {
    let head = read_head(&mut stream).await?;
    let text = String::from_utf8_lossy(&head);
    let request_line = text.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        respond(&mut stream, "400 Bad Request").await?;
        return Err(DialError::Io(format!("malformed request line '{request_line}'")));
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        // CONNECT host:port HTTP/1.1
        let dest = target.to_string();
        debug!("http proxy CONNECT {dest}");

        let outbound = match dialer.dial("tcp", &dest).await {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("http proxy dial {dest} failed: {e}");
                respond(&mut stream, "503 Service Unavailable").await?;
                return Err(e);
            }
        };

        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        let outcome = forward_duplex(stream, outbound).await;
        debug!(
            "http proxy {dest} closed: sent {} bytes, received {} bytes",
            outcome.bytes_sent, outcome.bytes_received
        );
        return Ok(());
    }

    // Plain request in absolute form: rewrite to origin-form and stream the
    // rest straight through.
    let Some((dest, origin_target)) = split_absolute_form(target) else {
        respond(&mut stream, "400 Bad Request").await?;
        return Err(DialError::Io(format!("not an absolute-form target '{target}'")));
    };
    debug!("http proxy {method} {dest}");

    let mut outbound = match dialer.dial("tcp", &dest).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("http proxy dial {dest} failed: {e}");
            respond(&mut stream, "503 Service Unavailable").await?;
            return Err(e);
        }
    };

    // Replay the buffered head with the rewritten request line.
    let version = request_line
        .rsplit_once(' ')
        .map(|(_, v)| v)
        .unwrap_or("HTTP/1.1");
    outbound
        .write_all(format!("{method} {origin_target} {version}\r\n").as_bytes())
        .await?;
    let line_len = request_line.len() + 2;
    outbound.write_all(&head[line_len.min(head.len())..]).await?;

    let outcome = forward_duplex(stream, outbound).await;
    debug!(
        "http proxy {dest} closed: sent {} bytes, received {} bytes",
        outcome.bytes_sent, outcome.bytes_received
    );
    Ok(())
}

/// Reads until the end of the header block (CRLFCRLF).
async fn read_head(stream: &mut TcpStream) -> Result<Vec<u8>, DialError> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(DialError::Io("request head too large".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(DialError::Io("connection closed mid-request".to_string()));
        }
        head.push(byte[0]);
    }
    Ok(head)
}

async fn respond(stream: &mut TcpStream, status: &str) -> Result<(), DialError> {
    stream
        .write_all(format!("HTTP/1.1 {status}\r\nConnection: close\r\n\r\n").as_bytes())
        .await?;
    Ok(())
}

/// Splits `http://host[:port]/path` into (`host:port`, `/path`).
fn split_absolute_form(target: &str) -> Option<(String, String)> {
    let rest = target.strip_prefix("http://")?;
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        return None;
    }
    let dest = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{host_port}:80")
    };
    Some((dest, path.to_string()))
}
