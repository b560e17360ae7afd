//! SOCKS5 client dialer.
//!
//! Speaks just enough of RFC 1928 to open a CONNECT tunnel through an
//! upstream SOCKS5 proxy: no-auth greeting, CONNECT request, reply check.

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{split_host_port, DialError, DialStream, Dialer};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Dials destinations through an upstream SOCKS5 proxy.
pub struct Socks5Dialer {
    proxy_addr: String,
}

impl Socks5Dialer {
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
        }
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<DialStream, DialError> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }

        let (host, port) = split_host_port(addr)?;
        debug!("socks5 dial {addr} via {}", self.proxy_addr);

        let mut stream = TcpStream::connect(&self.proxy_addr).await?;

        // Greeting: we only offer NO AUTH.
        stream
            .write_all(&[SOCKS_VERSION, 1, AUTH_NONE])
            .await
            .map_err(|e| DialError::Socks5(format!("greeting failed: {e}")))?;

        let mut reply = [0u8; 2];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| DialError::Socks5(format!("no greeting reply: {e}")))?;
        if reply[0] != SOCKS_VERSION || reply[1] != AUTH_NONE {
            return Err(DialError::Socks5(format!(
                "proxy rejected NO AUTH (version {}, method {:#04x})",
                reply[0], reply[1]
            )));
        }

        // CONNECT request.
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(ATYP_IPV4);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(DialError::InvalidAddress(addr.to_string()));
                }
                request.push(ATYP_DOMAIN);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());

        stream
            .write_all(&request)
            .await
            .map_err(|e| DialError::Socks5(format!("request failed: {e}")))?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream
            .read_exact(&mut head)
            .await
            .map_err(|e| DialError::Socks5(format!("no reply: {e}")))?;
        if head[1] != REP_SUCCESS {
            return Err(DialError::Socks5(format!(
                "proxy refused connection to {addr} (code {:#04x})",
                head[1]
            )));
        }

        // Discard the bound address.
        let bound_len = match head[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream
                    .read_exact(&mut len)
                    .await
                    .map_err(|e| DialError::Socks5(format!("truncated reply: {e}")))?;
                usize::from(len[0]) + 2
            }
            other => {
                return Err(DialError::Socks5(format!(
                    "unknown reply address type {other:#04x}"
                )))
            }
        };
        let mut skip = vec![0u8; bound_len];
        stream
            .read_exact(&mut skip)
            .await
            .map_err(|e| DialError::Socks5(format!("truncated reply: {e}")))?;

        Ok(Box::new(stream))
    }
}
