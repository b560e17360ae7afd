//! SSH connection manager.
//!
//! An [`SshDialer`] maintains at most one live SSH transport, shared by all
//! concurrent stream requests, and connects lazily: the first `dial` (or an
//! interactive connect driven over the control plane) starts a handshake
//! attempt, and everyone arriving while it runs waits on the same attempt.
//!
//! The cached client sits behind a read/write lock together with the
//! single-slot in-flight connector: readers multiplex streams concurrently,
//! invalidation and attempt creation take the write side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::client::Msg;
use russh::ChannelStream;
use tracing::{debug, info, warn};

use crate::dialer::{split_host_port, DialError, DialStream, Dialer};
use crate::singleflight::CallGroup;

use super::address::{parse_ssh_address, SshAddress};
use super::connector::{AttemptContext, SshConnector};
use super::controller::{spawn_client_task, SshController};
use super::error::SshError;
use super::keys::{decode_private_key, describe_key, SshKeyInfo};

/// Tunables for one SSH dialer.
#[derive(Debug, Clone)]
pub struct SshDialerConfig {
    /// Bound on each TCP connect and each protocol handshake.
    pub connect_timeout: Duration,
    /// Optional bound on the interactive passphrase wait. `None` preserves
    /// the historical behavior: an unanswered prompt stalls the attempt
    /// indefinitely.
    pub passphrase_timeout: Option<Duration>,
}

impl Default for SshDialerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            passphrase_timeout: None,
        }
    }
}

#[derive(Default)]
struct AuthState {
    /// Default user, taken from the first configured address that names one.
    user: Option<String>,
    signers: Vec<russh::keys::PrivateKey>,
}

#[derive(Default)]
struct ConnState {
    client: Option<SshController>,
    connector: Option<Arc<SshConnector>>,
}

struct Shared {
    config: SshDialerConfig,
    addresses: RwLock<Vec<SshAddress>>,
    auth: RwLock<AuthState>,
    conn: RwLock<ConnState>,
    connects: CallGroup<Result<SshController, SshError>>,
}

/// Manages one logical SSH connection and dials streams through it.
#[derive(Clone)]
pub struct SshDialer {
    shared: Arc<Shared>,
}

impl SshDialer {
    pub fn new(config: SshDialerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                addresses: RwLock::new(Vec::new()),
                auth: RwLock::new(AuthState::default()),
                conn: RwLock::new(ConnState::default()),
                connects: CallGroup::new(),
            }),
        }
    }

    /// Decodes and registers a private key for public-key authentication.
    pub fn add_ssh_key(&self, encoded: &str, passphrase: Option<&str>) -> Result<(), SshError> {
        let key = decode_private_key(encoded, passphrase)?;
        let mut auth = self.shared.auth.write();
        auth.signers.push(key);
        info!("registered ssh key ({} total)", auth.signers.len());
        Ok(())
    }

    /// The public halves of all registered signers.
    pub fn list_keys(&self) -> Vec<SshKeyInfo> {
        self.shared
            .auth
            .read()
            .signers
            .iter()
            .map(describe_key)
            .collect()
    }

    /// Appends one `ssh://[user@]host[:port]` target to the fallback list.
    ///
    /// The first target that names a user sets the dialer-wide default user.
    pub fn add_target(&self, uri: &str) -> Result<(), SshError> {
        let address = parse_ssh_address(uri)?;
        debug!("adding ssh target {address}");

        if let Some(user) = &address.user {
            let mut auth = self.shared.auth.write();
            if auth.user.is_none() {
                auth.user = Some(user.clone());
            }
        }

        self.shared.addresses.write().push(address);
        Ok(())
    }

    pub fn has_targets(&self) -> bool {
        !self.shared.addresses.read().is_empty()
    }

    /// Comma-separated target list, for display.
    pub fn destination(&self) -> String {
        let addresses = self.shared.addresses.read();
        addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns the in-flight connection attempt, starting one if none is
    /// running. `interactive` upgrades an existing attempt.
    pub fn connector(&self, interactive: bool) -> Arc<SshConnector> {
        {
            let conn = self.shared.conn.read();
            if let Some(connector) = &conn.connector {
                if interactive {
                    connector.set_interactive();
                }
                return Arc::clone(connector);
            }
        }

        let mut conn = self.shared.conn.write();
        // Raced with another creator between the locks?
        if let Some(connector) = &conn.connector {
            if interactive {
                connector.set_interactive();
            }
            return Arc::clone(connector);
        }

        let connector = Arc::new(SshConnector::new(interactive));
        conn.connector = Some(Arc::clone(&connector));
        drop(conn);

        let shared = Arc::clone(&self.shared);
        let attempt = Arc::clone(&connector);
        tokio::spawn(async move {
            run_attempt(shared, attempt).await;
        });

        connector
    }

    /// Blocks until a transport is available, starting an attempt if needed.
    pub async fn connect(&self) -> Result<SshController, SshError> {
        if let Some(client) = self.shared.conn.read().client.clone() {
            return Ok(client);
        }

        // Collapse concurrent slow paths into one attempt-wait per target set.
        let key = self.destination();
        let shared = Arc::clone(&self.shared);
        self.shared
            .connects
            .call_synchronized(&key, || {
                let shared = Arc::clone(&shared);
                async move { connect_once(shared).await }
            })
            .await
    }

    async fn dial_stream(&self, addr: &str) -> Result<ChannelStream<Msg>, SshError> {
        let (host, port) =
            split_host_port(addr).map_err(|e| SshError::Transport(e.to_string()))?;

        let cached = self.shared.conn.read().client.clone();
        if let Some(client) = cached {
            match client.open_stream(&host, port).await {
                Ok(stream) => return Ok(stream),
                // The tunnel is up but the destination was refused;
                // reconnecting would not help.
                Err(e) if e.is_channel_open() => return Err(e),
                Err(e) => {
                    warn!(
                        "dial {addr} failed: {e}, reconnecting ssh server {}...",
                        self.destination()
                    );
                    {
                        let mut conn = self.shared.conn.write();
                        if conn
                            .client
                            .as_ref()
                            .is_some_and(|current| current.same_client(&client))
                        {
                            conn.client = None;
                        }
                    }
                    client.shutdown().await;
                }
            }
        }

        let client = self.connect().await?;
        client.open_stream(&host, port).await
    }
}

async fn connect_once(shared: Arc<Shared>) -> Result<SshController, SshError> {
    if let Some(client) = shared.conn.read().client.clone() {
        return Ok(client);
    }

    let connector = SshDialer {
        shared: Arc::clone(&shared),
    }
    .connector(false);

    while !connector.done() {
        connector.wait().await;
    }

    if let Some(client) = shared.conn.read().client.clone() {
        return Ok(client);
    }
    Err(connector
        .error()
        .unwrap_or_else(|| SshError::Transport("connection attempt failed".to_string())))
}

/// Drives one attempt to its terminal state and publishes the outcome.
async fn run_attempt(shared: Arc<Shared>, connector: Arc<SshConnector>) {
    let ctx = AttemptContext {
        addresses: shared.addresses.read().clone(),
        signers: shared.auth.read().signers.clone(),
        default_user: shared.auth.read().user.clone(),
        connect_timeout: shared.config.connect_timeout,
        passphrase_timeout: shared.config.passphrase_timeout,
    };
    let label = shared
        .addresses
        .read()
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<unconfigured>".to_string());

    match connector.run_attempt(ctx).await {
        Some(handle) => {
            let client = spawn_client_task(handle, label);
            {
                let mut conn = shared.conn.write();
                conn.client = Some(client);
                conn.connector = None;
            }
            // Client is in place before waiters observe the terminal state.
            connector.succeed();
        }
        None => {
            shared.conn.write().connector = None;
            connector.fail();
        }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<DialStream, DialError> {
        if !matches!(network, "tcp" | "tcp4" | "tcp6") {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }
        let stream = self.dial_stream(addr).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use crate::ssh::controller::ClientCommand;

    use super::*;

    /// Installs a fake client whose open-stream replies come from `answer`.
    fn install_fake_client(
        dialer: &SshDialer,
        answer: fn() -> Result<russh::Channel<Msg>, russh::Error>,
    ) -> SshController {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ClientCommand>(4);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ClientCommand::OpenDirectTcpip { reply_tx, .. } => {
                        let _ = reply_tx.send(answer());
                    }
                    ClientCommand::Disconnect => break,
                }
            }
        });
        let controller = SshController::for_test(cmd_tx);
        dialer.shared.conn.write().client = Some(controller.clone());
        controller
    }

    #[tokio::test]
    async fn channel_open_refusal_does_not_invalidate_the_client() {
        let dialer = SshDialer::new(SshDialerConfig::default());
        install_fake_client(&dialer, || {
            Err(russh::Error::ChannelOpenFailure(
                russh::ChannelOpenFailure::ConnectFailed,
            ))
        });

        let err = dialer.dial_stream("10.1.2.3:443").await.err().unwrap();
        assert!(err.is_channel_open());

        // The cached client must survive, and no reconnect attempt may have
        // been started.
        let conn = dialer.shared.conn.read();
        assert!(conn.client.is_some());
        assert!(conn.connector.is_none());
    }

    #[tokio::test]
    async fn transport_failure_invalidates_and_reconnects() {
        // No addresses are configured, so the triggered reconnect fails fast;
        // what matters is that the dead client was dropped from the slot.
        let dialer = SshDialer::new(SshDialerConfig {
            connect_timeout: Duration::from_secs(1),
            passphrase_timeout: None,
        });
        install_fake_client(&dialer, || Err(russh::Error::Disconnect));

        let err = dialer.dial_stream("10.1.2.3:443").await.err().unwrap();
        assert!(!err.is_channel_open());
        assert!(dialer.shared.conn.read().client.is_none());
    }

    #[tokio::test]
    async fn concurrent_connectors_share_one_attempt() {
        let dialer = SshDialer::new(SshDialerConfig::default());
        // No targets: the attempt terminates quickly, but both requests must
        // have observed the same instance.
        let a = dialer.connector(false);
        let b = dialer.connector(true);
        assert!(Arc::ptr_eq(&a, &b));
        // The interactive request upgraded the shared attempt.
        assert!(a.interactive());
    }

    #[tokio::test]
    async fn connect_without_targets_reports_the_attempt_error() {
        let dialer = SshDialer::new(SshDialerConfig::default());
        let err = dialer.connect().await.err().unwrap();
        assert!(matches!(err, SshError::Transport(_)));
    }

    #[test]
    fn first_target_user_becomes_default() {
        let dialer = SshDialer::new(SshDialerConfig::default());
        dialer.add_target("ssh://alpha@one.example.com").unwrap();
        dialer.add_target("ssh://beta@two.example.com:2222").unwrap();
        assert_eq!(dialer.shared.auth.read().user.as_deref(), Some("alpha"));
        assert_eq!(
            dialer.destination(),
            "alpha@one.example.com:22,beta@two.example.com:2222"
        );
    }

    #[test]
    fn invalid_target_is_rejected() {
        let dialer = SshDialer::new(SshDialerConfig::default());
        assert!(matches!(
            dialer.add_target("socks5://bad.example.com"),
            Err(SshError::InvalidUri(_))
        ));
        assert!(!dialer.has_targets());
    }
}
