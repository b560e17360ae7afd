//! Proxy front-ends.
//!
//! Each front-end accepts local connections, determines the intended
//! destination by protocol-specific means, resolves it through the injected
//! dialer (normally the rule set) and duplex-forwards bytes. Front-ends bind
//! to loopback only; binding port 0 picks an ephemeral port, reported by
//! [`Proxy::port`].

mod forward;
mod http;
mod socks5;
mod tcp;

pub use forward::{forward_duplex, ForwardOutcome};
pub use http::HttpProxy;
pub use socks5::Socks5Proxy;
pub use tcp::TcpProxy;

use std::io;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::dialer::Dialer;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] io::Error),

    #[error("unknown proxy type '{0}'")]
    UnknownKind(String),

    #[error("invalid proxy parameters '{0}'")]
    InvalidParams(String),
}

/// The supported front-end protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Transparent TCP redirect (destination recovered from the socket).
    Tcp,
    /// SOCKS5 CONNECT.
    Socks5,
    /// HTTP CONNECT (plus absolute-form passthrough).
    Http,
}

impl FromStr for ProxyKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ProxyKind::Tcp),
            "socks5" => Ok(ProxyKind::Socks5),
            "http" => Ok(ProxyKind::Http),
            other => Err(ProxyError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
        };
        f.write_str(name)
    }
}

/// Listing entry for a running front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub port: u16,
    #[serde(default)]
    pub params: String,
}

/// Contract every front-end exposes to the service layer.
pub trait Proxy: Send + Sync {
    /// The bound listening port.
    fn port(&self) -> u16;

    /// Replaces the dialer used for subsequently accepted connections.
    fn set_dialer(&self, dialer: Arc<dyn Dialer>);
}

/// Dialer slot shared between a front-end's accept loop and `set_dialer`.
pub(crate) type SharedDialer = Arc<RwLock<Arc<dyn Dialer>>>;

/// Binds a loopback listener, returning it with the actual port.
pub(crate) async fn bind_loopback(port: u16) -> Result<(TcpListener, u16), ProxyError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}
