//! Dialers - named capabilities for establishing outbound stream connections.
//!
//! A dialer takes `(network, address)` and produces a byte stream. The
//! registry maps names to dialers so routing rules can refer to them; the
//! concrete implementations are the direct system dial, a SOCKS5 client and
//! the SSH connection manager.

mod direct;
mod registry;
mod socks5;

pub use direct::DirectDialer;
pub use registry::{DialerInfo, DialerKind, DialerRegistry};
pub use socks5::Socks5Dialer;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::ssh::SshError;

/// Object-safe alias for the streams dialers hand out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An established outbound connection.
pub type DialStream = Box<dyn AsyncStream>;

#[derive(Error, Debug, Clone)]
pub enum DialError {
    #[error("no dialer registered under '{0}'")]
    UnknownDialer(String),

    #[error("unsupported network '{0}'")]
    UnsupportedNetwork(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("SOCKS5 dial failed: {0}")]
    Socks5(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DialError {
    fn from(err: std::io::Error) -> Self {
        DialError::Io(err.to_string())
    }
}

/// Anything capable of establishing an outbound stream connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establishes a connection to `addr` (`host:port`) on `network`
    /// (`tcp`, `tcp4` or `tcp6`).
    async fn dial(&self, network: &str, addr: &str) -> Result<DialStream, DialError>;
}

/// Splits `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(addr: &str) -> Result<(String, u16), DialError> {
    let invalid = || DialError::InvalidAddress(addr.to_string());

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        let port = after
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains(':') {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            split_host_port("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:22").unwrap(),
            ("2001:db8::1".to_string(), 22)
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port(":443").is_err());
        assert!(split_host_port("2001:db8::1:22").is_err());
        assert!(split_host_port("[::1]").is_err());
    }
}
