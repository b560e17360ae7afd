//! SSH handshake state machine.
//!
//! An [`SshConnector`] drives one connection attempt across the dialer's
//! ordered address list and reports progress to any number of waiters:
//!
//! ```text
//! Connecting ──▶ Handshake ──▶ Succeeded
//!      ▲            │  ▲
//!      │            ▼  │              (terminal on address exhaustion)
//!   next address   NeedPassphrase ──▶ Failed
//! ```
//!
//! `Connecting` and `Handshake` are transient per-address steps.
//! `NeedPassphrase` is entered when key and agent authentication are
//! exhausted and an interactively supplied secret is required; it returns to
//! `Handshake` once a caller provides one via [`SshConnector::set_passphrase`].
//! Every state transition notifies all registered waiters, so a synchronous
//! caller can block until a terminal state while a remote poller observes
//! incremental progress.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::address::SshAddress;
use super::agent::{self, SshAgentClient};
use super::error::SshError;

/// How many times a rejected interactive password is re-prompted per address.
const PASSWORD_ATTEMPTS: usize = 3;

/// Connection attempt status, observable over the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Connecting,
    Handshake,
    NeedPassphrase,
    Succeeded,
    Failed,
}

impl ConnectStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectStatus::Succeeded | ConnectStatus::Failed)
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectStatus::Connecting => "connecting",
            ConnectStatus::Handshake => "handshake",
            ConnectStatus::NeedPassphrase => "need_passphrase",
            ConnectStatus::Succeeded => "succeeded",
            ConnectStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a connection attempt needs, snapshotted from the dialer when
/// the attempt starts. Later configuration changes affect the next attempt.
pub(crate) struct AttemptContext {
    pub addresses: Vec<SshAddress>,
    pub signers: Vec<PrivateKey>,
    pub default_user: Option<String>,
    pub connect_timeout: Duration,
    pub passphrase_timeout: Option<Duration>,
}

struct ConnectorState {
    status: ConnectStatus,
    messages: Vec<String>,
    passphrase: Option<String>,
    error: Option<SshError>,
    interactive: bool,
    waiting: Vec<oneshot::Sender<()>>,
}

/// One in-flight connection attempt, shared by the dialer that started it and
/// any number of waiters.
pub struct SshConnector {
    state: RwLock<ConnectorState>,
}

impl SshConnector {
    pub(crate) fn new(interactive: bool) -> Self {
        Self {
            state: RwLock::new(ConnectorState {
                status: ConnectStatus::Connecting,
                messages: Vec::new(),
                passphrase: None,
                error: None,
                interactive,
                waiting: Vec::new(),
            }),
        }
    }

    pub fn status(&self) -> ConnectStatus {
        self.state.read().status
    }

    /// True only once the attempt reached `Succeeded` or `Failed`.
    pub fn done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn error(&self) -> Option<SshError> {
        self.state.read().error.clone()
    }

    pub fn interactive(&self) -> bool {
        self.state.read().interactive
    }

    /// Marks the attempt as interactively driven. A second caller requesting
    /// a connector while one is in flight upgrades the shared instance.
    pub fn set_interactive(&self) {
        self.state.write().interactive = true;
    }

    /// Number of progress messages appended so far.
    ///
    /// Together with [`message`](Self::message) this lets a poller fetch only
    /// the lines appended since its last poll.
    pub fn message_count(&self) -> usize {
        self.state.read().messages.len()
    }

    pub fn message(&self, index: usize) -> Option<String> {
        self.state.read().messages.get(index).cloned()
    }

    /// Supplies the passphrase the attempt is blocked on.
    ///
    /// Fails with [`SshError::WrongState`] unless the status is
    /// `NeedPassphrase`; on success the status returns to `Handshake` and all
    /// waiters are woken.
    pub fn set_passphrase(&self, passphrase: &str) -> Result<(), SshError> {
        let mut state = self.state.write();
        if state.status != ConnectStatus::NeedPassphrase {
            return Err(SshError::WrongState {
                expected: ConnectStatus::NeedPassphrase,
                have: state.status,
            });
        }
        state.passphrase = Some(passphrase.to_string());
        state.status = ConnectStatus::Handshake;
        notify_waiting(&mut state);
        Ok(())
    }

    /// Blocks until the next state transition (or returns immediately in a
    /// terminal state).
    pub async fn wait(&self) {
        let rx = {
            let mut state = self.state.write();
            if state.status.is_terminal() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push(tx);
            rx
        };
        let _ = rx.await;
    }

    pub(crate) fn print(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("ssh connect: {message}");
        let mut state = self.state.write();
        state.messages.push(message);
        notify_waiting(&mut state);
    }

    fn set_status(&self, status: ConnectStatus) {
        let mut state = self.state.write();
        state.status = status;
        notify_waiting(&mut state);
    }

    fn set_error(&self, error: SshError) {
        self.state.write().error = Some(error);
    }

    /// Terminal success; the dialer stores the client before calling this, so
    /// a waiter observing `Succeeded` always finds the client in place.
    pub(crate) fn succeed(&self) {
        let mut state = self.state.write();
        state.status = ConnectStatus::Succeeded;
        state.error = None;
        notify_waiting(&mut state);
    }

    /// Terminal failure; keeps the last recorded error.
    pub(crate) fn fail(&self) {
        let mut state = self.state.write();
        state.status = ConnectStatus::Failed;
        if state.error.is_none() {
            state.error = Some(SshError::Transport(
                "connection attempt failed".to_string(),
            ));
        }
        notify_waiting(&mut state);
    }

    /// Runs one connection attempt over the configured addresses, in order.
    ///
    /// Returns the authenticated transport handle on success; the caller is
    /// responsible for storing the client and moving the connector to its
    /// terminal state.
    pub(crate) async fn run_attempt(
        self: &Arc<Self>,
        ctx: AttemptContext,
    ) -> Option<Handle<HandshakeHandler>> {
        if ctx.addresses.is_empty() {
            self.print("No ssh targets configured");
            self.set_error(SshError::Transport("no ssh targets configured".to_string()));
            return None;
        }

        for address in &ctx.addresses {
            let user = address.effective_user(ctx.default_user.as_deref());
            let target = format!("{}@{}:{}", user, address.host, address.port);

            self.print(format!("Trying to connect to {target}"));
            self.set_status(ConnectStatus::Connecting);

            let stream = match timeout(
                ctx.connect_timeout,
                TcpStream::connect((address.host.as_str(), address.port)),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.print(format!("Connect to {target} failed. Reason: {e}"));
                    self.set_error(SshError::Transport(e.to_string()));
                    continue;
                }
                Err(_) => {
                    self.print(format!("Connect to {target} timed out"));
                    self.set_error(SshError::Transport(format!(
                        "connect to {target} timed out"
                    )));
                    continue;
                }
            };

            self.set_status(ConnectStatus::Handshake);

            let config = Arc::new(client::Config {
                inactivity_timeout: None,
                keepalive_interval: Some(Duration::from_secs(30)),
                keepalive_max: 3,
                ..Default::default()
            });
            let handler = HandshakeHandler {
                connector: Arc::clone(self),
            };

            let mut handle =
                match timeout(ctx.connect_timeout, client::connect_stream(config, stream, handler))
                    .await
                {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(e)) => {
                        self.print(format!("Handshake with {target} failed. Reason: {e}"));
                        self.set_error(SshError::Handshake(e.to_string()));
                        continue;
                    }
                    Err(_) => {
                        self.print(format!("Handshake with {target} timed out"));
                        self.set_error(SshError::Handshake(format!(
                            "handshake with {target} timed out"
                        )));
                        continue;
                    }
                };

            match self.authenticate(&mut handle, &user, &ctx).await {
                Ok(true) => {
                    self.print(format!("Handshake with {target} succeeded"));
                    return Some(handle);
                }
                Ok(false) => {
                    self.print(format!(
                        "Handshake with {target} failed. Reason: authentication rejected by server"
                    ));
                    self.set_error(SshError::Handshake(
                        "authentication rejected by server".to_string(),
                    ));
                }
                Err(e) => {
                    self.print(format!("Handshake with {target} failed. Reason: {e}"));
                    self.set_error(e);
                }
            }
        }

        None
    }

    /// Authentication order: configured signers, agent identities, then the
    /// interactive password/passphrase cycle.
    async fn authenticate(
        &self,
        handle: &mut Handle<HandshakeHandler>,
        user: &str,
        ctx: &AttemptContext,
    ) -> Result<bool, SshError> {
        for key in &ctx.signers {
            let key = PrivateKeyWithHashAlg::new(Arc::new(key.clone()), None);
            match handle.authenticate_publickey(user, key).await {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => debug!("public key rejected by server"),
                Err(e) => self.print(format!("Public-key authentication error: {e}")),
            }
        }

        if agent::is_agent_available() {
            self.print("Trying to use SSH agent");
            match SshAgentClient::connect().await {
                Ok(mut agent) => match agent.authenticate(handle, user).await {
                    Ok(true) => return Ok(true),
                    Ok(false) => self.print("No agent key was accepted by the server"),
                    Err(e) => self.print(format!("SSH agent authentication failed: {e}")),
                },
                Err(e) => self.print(format!("Failed to connect to SSH agent: {e}")),
            }
        }

        for _ in 0..PASSWORD_ATTEMPTS {
            let Some(passphrase) = self.wait_for_passphrase(ctx.passphrase_timeout).await else {
                return Ok(false);
            };
            match handle.authenticate_password(user, &passphrase).await {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => self.print("Passphrase rejected by server"),
                Err(e) => return Err(SshError::Handshake(e.to_string())),
            }
        }

        Ok(false)
    }

    /// Enters `NeedPassphrase` and blocks until a passphrase arrives.
    ///
    /// Without a configured timeout this waits indefinitely; an unattended
    /// daemon stalls here until an interactive caller answers.
    async fn wait_for_passphrase(&self, wait_timeout: Option<Duration>) -> Option<String> {
        self.set_status(ConnectStatus::NeedPassphrase);
        let deadline = wait_timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut state = self.state.write();
                if let Some(passphrase) = state.passphrase.take() {
                    // set_passphrase already moved the status back to
                    // Handshake under this lock.
                    return Some(passphrase);
                }
                if state.status.is_terminal() {
                    return None;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, self.wait()).await.is_err() {
                        self.print("Timed out waiting for passphrase");
                        return None;
                    }
                }
                None => self.wait().await,
            }
        }
    }
}

fn notify_waiting(state: &mut ConnectorState) {
    for tx in state.waiting.drain(..) {
        let _ = tx.send(());
    }
}

/// russh callback handler used during the handshake.
///
/// Host keys are accepted unconditionally: this is a client-initiated tunnel
/// to a host the user named explicitly, and the tunnel carries its own
/// end-to-end protocols.
pub struct HandshakeHandler {
    connector: Arc<SshConnector>,
}

impl client::Handler for HandshakeHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        for line in banner.lines() {
            self.connector.print(line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn force_status(connector: &SshConnector, status: ConnectStatus) {
        connector.state.write().status = status;
    }

    #[test]
    fn set_passphrase_outside_need_passphrase_is_rejected() {
        let connector = SshConnector::new(false);
        assert_eq!(connector.status(), ConnectStatus::Connecting);

        let err = connector.set_passphrase("secret").unwrap_err();
        assert!(matches!(
            err,
            SshError::WrongState {
                expected: ConnectStatus::NeedPassphrase,
                have: ConnectStatus::Connecting,
            }
        ));
        // State must be unaltered.
        assert_eq!(connector.status(), ConnectStatus::Connecting);
        assert!(connector.state.read().passphrase.is_none());
    }

    #[tokio::test]
    async fn set_passphrase_resumes_handshake_and_wakes_waiters() {
        let connector = Arc::new(SshConnector::new(true));
        force_status(&connector, ConnectStatus::NeedPassphrase);

        let waiter = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.wait().await })
        };
        // Give the waiter a chance to register.
        tokio::time::sleep(Duration::from_millis(10)).await;

        connector.set_passphrase("secret").unwrap();
        assert_eq!(connector.status(), ConnectStatus::Handshake);
        assert_eq!(connector.state.read().passphrase.as_deref(), Some("secret"));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be woken by set_passphrase")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_terminal() {
        let connector = SshConnector::new(false);
        connector.fail();
        // Must not block.
        tokio::time::timeout(Duration::from_millis(100), connector.wait())
            .await
            .expect("wait in terminal state returns immediately");
        assert!(connector.done());
        assert!(connector.error().is_some());
    }

    #[tokio::test]
    async fn wait_for_passphrase_times_out_when_configured() {
        let connector = Arc::new(SshConnector::new(false));
        let got = connector
            .wait_for_passphrase(Some(Duration::from_millis(50)))
            .await;
        assert!(got.is_none());
        let last = connector.message(connector.message_count() - 1).unwrap();
        assert!(last.contains("Timed out"));
    }

    #[tokio::test]
    async fn attempt_falls_through_unreachable_addresses() {
        // First address: nothing listens on port 1. Second address: accepts
        // the TCP connection but closes immediately, so the ssh handshake
        // fails too. The attempt must try both, record a failure message for
        // each, and end terminally failed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let connector = Arc::new(SshConnector::new(false));
        let ctx = AttemptContext {
            addresses: vec![
                crate::ssh::address::parse_ssh_address("ssh://tester@127.0.0.1:1").unwrap(),
                crate::ssh::address::parse_ssh_address(&format!("ssh://tester@127.0.0.1:{port}"))
                    .unwrap(),
            ],
            signers: Vec::new(),
            default_user: None,
            connect_timeout: Duration::from_secs(2),
            passphrase_timeout: Some(Duration::from_millis(100)),
        };

        let outcome = connector.run_attempt(ctx).await;
        assert!(outcome.is_none());
        connector.fail();
        assert_eq!(connector.status(), ConnectStatus::Failed);

        let messages: Vec<String> = (0..connector.message_count())
            .filter_map(|i| connector.message(i))
            .collect();
        assert!(
            messages
                .iter()
                .any(|m| m.starts_with("Connect to tester@127.0.0.1:1 ")),
            "expected a connect failure for the first address, got {messages:?}"
        );
        assert!(
            messages.iter().any(|m| m.contains(&format!("127.0.0.1:{port}"))),
            "expected the second address to be tried, got {messages:?}"
        );
    }

    #[tokio::test]
    async fn empty_address_list_fails_fast() {
        let connector = Arc::new(SshConnector::new(false));
        let ctx = AttemptContext {
            addresses: Vec::new(),
            signers: Vec::new(),
            default_user: None,
            connect_timeout: Duration::from_secs(1),
            passphrase_timeout: None,
        };
        assert!(connector.run_attempt(ctx).await.is_none());
        assert!(connector.error().is_some());
    }
}
