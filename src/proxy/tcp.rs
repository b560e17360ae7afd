//! Transparent TCP proxy front-end.
//!
//! Receives connections redirected by the firewall (iptables REDIRECT /
//! pf rdr) and recovers the client's originally intended destination from the
//! socket, then dials it through the injected dialer. Destination recovery is
//! Linux-only (`SO_ORIGINAL_DST`); on other platforms accepted connections
//! are rejected with an error log.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::dialer::Dialer;

use super::{bind_loopback, forward_duplex, Proxy, ProxyError, SharedDialer};

/// Transparent proxy front-end.
pub struct TcpProxy {
    port: u16,
    dialer: SharedDialer,
}

impl TcpProxy {
    /// Binds `127.0.0.1:port` (0 for ephemeral) and starts accepting.
    pub async fn start(port: u16, dialer: Arc<dyn Dialer>) -> Result<Self, ProxyError> {
        let (listener, port) = bind_loopback(port).await?;
        let dialer: SharedDialer = Arc::new(RwLock::new(dialer));
        debug!("transparent tcp proxy listening on 127.0.0.1:{port}");

        let shared = Arc::clone(&dialer);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let dialer = Arc::clone(&*shared.read());
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(dialer, stream).await {
                                warn!("transparent proxy connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("transparent proxy accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self { port, dialer })
    }
}

impl Proxy for TcpProxy {
    fn port(&self) -> u16 {
        self.port
    }

    fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = dialer;
    }
}

async fn handle_connection(dialer: Arc<dyn Dialer>, stream: TcpStream) -> io::Result<()> {
    let dest = original_destination(&stream)?;
    // A destination equal to our own listener means the connection was not
    // redirected at all; dialing it would loop back into the proxy.
    if stream.local_addr()? == dest {
        return Err(io::Error::other(format!(
            "connection to {dest} was not redirected"
        )));
    }
    info!("transparent proxy: connecting to {dest}");

    let outbound = dialer
        .dial("tcp", &dest.to_string())
        .await
        .map_err(io::Error::other)?;

    let outcome = forward_duplex(stream, outbound).await;
    info!(
        "transparent proxy {dest} closed: sent {} bytes, received {} bytes",
        outcome.bytes_sent, outcome.bytes_received
    );
    match outcome.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Reads the pre-redirect destination the client actually dialed.
#[cfg(target_os = "linux")]
fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();

    // IPv4 redirect entry
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        ) == 0
        {
            let ip = IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)));
            return Ok(SocketAddr::new(ip, u16::from_be(addr.sin_port)));
        }
    }

    // IPv6 redirect entry
    unsafe {
        let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        ) == 0
        {
            let ip = IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr));
            return Ok(SocketAddr::new(ip, u16::from_be(addr.sin6_port)));
        }
    }

    Err(io::Error::last_os_error())
}

#[cfg(not(target_os = "linux"))]
fn original_destination(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent proxying requires SO_ORIGINAL_DST (linux only)",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let proxy = TcpProxy::start(0, Arc::new(crate::dialer::DirectDialer))
            .await
            .unwrap();
        assert_ne!(proxy.port(), 0);
    }

    #[tokio::test]
    async fn non_redirected_connection_is_dropped() {
        // A direct connection to the listener carries no redirect metadata,
        // so the handler must fail without forwarding anything.
        let proxy = TcpProxy::start(0, Arc::new(crate::dialer::DirectDialer))
            .await
            .unwrap();
        let stream = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();

        // The proxy closes the connection once destination recovery fails.
        let mut buf = [0u8; 1];
        use tokio::io::AsyncReadExt;
        let mut stream = stream;
        let read = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("proxy must close the connection");
        assert_eq!(read.unwrap_or(0), 0);
    }
}
