//! Duplex byte forwarding between an accepted connection and a dialed one.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Result of one forwarded connection.
#[derive(Debug, Default)]
pub struct ForwardOutcome {
    /// Bytes copied inbound → outbound.
    pub bytes_sent: u64,
    /// Bytes copied outbound → inbound.
    pub bytes_received: u64,
    /// First observed error, send side preferred.
    pub error: Option<io::Error>,
}

/// Copies bytes in both directions until either side finishes.
///
/// A tunnel is a full pipe: when one direction hits EOF or an error, both
/// legs are torn down so the other copy loop terminates too - a half-closed
/// leg would otherwise leak sockets indefinitely. Byte counts cover
/// everything actually copied, including the torn-down direction's progress.
pub async fn forward_duplex<A, B>(inbound: A, outbound: B) -> ForwardOutcome
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let sent_counter = Arc::clone(&sent);
    let mut send_task = tokio::spawn(async move {
        let err = copy_counted(&mut in_read, &mut out_write, &sent_counter).await;
        let _ = out_write.shutdown().await;
        err
    });

    let received_counter = Arc::clone(&received);
    let mut recv_task = tokio::spawn(async move {
        let err = copy_counted(&mut out_read, &mut in_write, &received_counter).await;
        let _ = in_write.shutdown().await;
        err
    });

    let (send_err, recv_err) = tokio::select! {
        first = &mut send_task => {
            recv_task.abort();
            let send_err = first.unwrap_or_else(|_| Some(io::Error::other("forward task failed")));
            let recv_err = recv_task.await.ok().flatten();
            (send_err, recv_err)
        }
        first = &mut recv_task => {
            send_task.abort();
            let recv_err = first.unwrap_or_else(|_| Some(io::Error::other("forward task failed")));
            let send_err = send_task.await.ok().flatten();
            (send_err, recv_err)
        }
    };

    ForwardOutcome {
        bytes_sent: sent.load(Ordering::Relaxed),
        bytes_received: received.load(Ordering::Relaxed),
        error: send_err.or(recv_err),
    }
}

/// Copy loop that keeps its running total observable from outside, so the
/// count survives the task being torn down mid-stream.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, count: &AtomicU64) -> Option<io::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return Some(e);
                }
                count.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => return Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn forwards_bytes_in_both_directions() {
        let (inbound, mut client) = tokio::io::duplex(1024);
        let (outbound, mut server) = tokio::io::duplex(1024);

        let forward = tokio::spawn(forward_duplex(inbound, outbound));

        client.write_all(b"request bytes").await.unwrap();
        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request bytes");

        server.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Closing the client side terminates both copy loops.
        drop(client);
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), forward)
            .await
            .expect("forward must terminate when one leg closes")
            .unwrap();

        assert_eq!(outcome.bytes_sent, 13);
        assert_eq!(outcome.bytes_received, 5);
    }

    #[tokio::test]
    async fn closing_the_dialed_side_also_terminates() {
        let (inbound, mut client) = tokio::io::duplex(1024);
        let (outbound, server) = tokio::io::duplex(1024);

        let forward = tokio::spawn(forward_duplex(inbound, outbound));

        client.write_all(b"hello").await.unwrap();
        drop(server);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), forward)
            .await
            .expect("forward must terminate when the dialed side closes")
            .unwrap();
        assert_eq!(outcome.bytes_received, 0);
    }

    #[tokio::test]
    async fn large_transfer_is_counted_exactly() {
        let (inbound, mut client) = tokio::io::duplex(4096);
        let (outbound, mut server) = tokio::io::duplex(4096);

        let forward = tokio::spawn(forward_duplex(inbound, outbound));

        let payload = vec![0xA5u8; 256 * 1024];
        let expected = payload.len() as u64;

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            drop(client);
        });

        let mut sink = Vec::new();
        server.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink.len() as u64, expected);

        writer.await.unwrap();
        let outcome = forward.await.unwrap();
        assert_eq!(outcome.bytes_sent, expected);
    }
}
