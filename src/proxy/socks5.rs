//! SOCKS5 front-end.
//!
//! Local SOCKS5 proxy that resolves each CONNECT destination through the
//! injected dialer. Only the NO AUTH method and the CONNECT command are
//! supported; clients requesting anything else get the matching SOCKS5 error
//! reply.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::dialer::{DialError, Dialer};

use super::{bind_loopback, forward_duplex, Proxy, ProxyError, SharedDialer};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 proxy front-end.
pub struct Socks5Proxy {
    port: u16,
    dialer: SharedDialer,
}

impl Socks5Proxy {
    /// Binds `127.0.0.1:port` (0 for ephemeral) and starts accepting.
    pub async fn start(port: u16, dialer: Arc<dyn Dialer>) -> Result<Self, ProxyError> {
        let (listener, port) = bind_loopback(port).await?;
        let dialer: SharedDialer = Arc::new(RwLock::new(dialer));
        debug!("socks5 proxy listening on 127.0.0.1:{port}");

        let shared = Arc::clone(&dialer);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let dialer = Arc::clone(&*shared.read());
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(dialer, stream).await {
                                warn!("socks5 connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("socks5 accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self { port, dialer })
    }
}

impl Proxy for Socks5Proxy {
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
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {e}");
    }

    // Greeting: VER NMETHODS METHODS...
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(DialError::Io(format!("unsupported SOCKS version {version}")));
    }
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await.ok();
        return Err(DialError::Io(
            "client does not offer the NO AUTH method".to_string(),
        ));
    }
    stream.write_all(&[VERSION, AUTH_NONE]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(DialError::Io("bad version in SOCKS5 request".to_string()));
    }
    if head[1] != CMD_CONNECT {
        send_reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(DialError::Io(format!("unsupported SOCKS5 command {}", head[1])));
    }

    let dest_host = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        other => {
            send_reply(&mut stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(DialError::Io(format!("unsupported address type {other}")));
        }
    };
    let dest_port = stream.read_u16().await?;
    let dest = format!("{dest_host}:{dest_port}");

    debug!("socks5 connect to {dest}");

    let outbound = match dialer.dial("tcp", &dest).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("socks5 dial {dest} failed: {e}");
            send_reply(&mut stream, REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };

    send_reply(&mut stream, REP_SUCCESS).await?;

    let outcome = forward_duplex(stream, outbound).await;
    debug!(
        "socks5 {dest} closed: sent {} bytes, received {} bytes",
        outcome.bytes_sent, outcome.bytes_received
    );
    Ok(())
}

/// Sends a reply with 0.0.0.0:0 as the bound address.
async fn send_reply(stream: &mut TcpStream, code: u8) -> Result<(), DialError> {
    let reply = [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    Ok(())
}
