//! Single-owner task for an established SSH transport.
//!
//! russh's `client::Handle` cannot be shared between tasks, so one task owns
//! it and everyone else talks to it through a cloneable [`SshController`].
//! Dropping the last controller, or an explicit [`SshController::shutdown`],
//! terminates the task and disconnects the transport.

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::connector::HandshakeHandler;
use super::error::SshError;

pub(crate) enum ClientCommand {
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    Disconnect,
}

/// Cheaply cloneable handle to the owner task of one SSH transport.
#[derive(Clone)]
pub struct SshController {
    cmd_tx: mpsc::Sender<ClientCommand>,
}

impl SshController {
    /// Opens a logical stream to `host:port` multiplexed over the transport.
    ///
    /// A channel-open refusal from the server surfaces as
    /// [`SshError::ChannelOpen`]; the transport stays usable.
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<ChannelStream<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::OpenDirectTcpip {
                host: host.to_string(),
                port: u32::from(port),
                originator: "127.0.0.1".to_string(),
                originator_port: 0,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;

        let channel = reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(SshError::from)?;
        Ok(channel.into_stream())
    }

    /// Asks the owner task to disconnect and exit.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Disconnect).await;
    }

    /// Whether the owner task is still alive.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Whether `other` is a clone of this controller.
    pub fn same_client(&self, other: &SshController) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    #[cfg(test)]
    pub(crate) fn for_test(cmd_tx: mpsc::Sender<ClientCommand>) -> Self {
        Self { cmd_tx }
    }
}

/// Consumes an authenticated `Handle` and returns the controller for it.
pub(crate) fn spawn_client_task(handle: Handle<HandshakeHandler>, label: String) -> SshController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientCommand>(64);

    tokio::spawn(async move {
        // Moved into the task; sole owner from here on.
        let mut handle = handle;
        debug!("ssh client task started for {label}");

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ClientCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Caller went away; the dropped channel closes itself.
                        debug!("caller dropped before receiving direct-tcpip reply");
                    }
                }
                ClientCommand::Disconnect => break,
            }
        }

        drain_pending(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
            .await;
        info!("ssh client task terminated for {label}");
    });

    SshController { cmd_tx }
}

/// Answers queued commands with a disconnect error before the task exits.
fn drain_pending(cmd_rx: &mut mpsc::Receiver<ClientCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            ClientCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            ClientCommand::Disconnect => {}
        }
    }
}
