//! Direct system-level dialer.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{DialError, DialStream, Dialer};

/// Dials destinations straight through the host network stack, bypassing any
/// tunnel. Used as the routing fallback when no rule matches.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<DialStream, DialError> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }
        debug!("direct dial {addr}");
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn dials_a_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut stream = DirectDialer
            .dial("tcp", &addr.to_string())
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn rejects_udp() {
        let err = DirectDialer.dial("udp", "127.0.0.1:53").await.err().unwrap();
        assert!(matches!(err, DialError::UnsupportedNetwork(_)));
    }
}
