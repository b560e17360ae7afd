//! Control server.
//!
//! Listens on a Unix-domain socket and serves line-delimited JSON requests
//! against the [`TunnelService`]. The interactive connect cycle hands out an
//! opaque session id on the first call and streams connector progress on
//! subsequent polls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::service::{ServiceError, TunnelService};
use crate::ssh::{ConnectStatus, SshConnector, SshError};

use super::api::{ConnectProgress, Request, Response, ResponseBody};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("there is no connect session with id '{0}'")]
    UnknownSession(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    Remote(String),
}

/// Connect sessions abandoned for this long are dropped on the next poll.
const SESSION_IDLE_LIMIT: Duration = Duration::from_secs(600);

struct ConnectSession {
    connector: Arc<SshConnector>,
    /// Index of the first message not yet delivered to the client.
    cursor: usize,
    last_activity: Instant,
}

/// Serves the control surface for one [`TunnelService`].
pub struct ControlServer {
    service: Arc<TunnelService>,
    sessions: DashMap<String, ConnectSession>,
    stop_tx: mpsc::Sender<()>,
}

impl ControlServer {
    /// Creates the server plus the receiver that resolves once a `stop`
    /// request arrives.
    pub fn new(service: Arc<TunnelService>) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                service,
                sessions: DashMap::new(),
                stop_tx,
            }),
            stop_rx,
        )
    }

    /// Accept loop; returns when `stop` is requested.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        info!("control server listening");
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("control server stopping");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_client(stream).await {
                                debug!("control client ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("control accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream) -> Result<(), ControlError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => match self.dispatch(request).await {
                    Ok(body) => Response::Ok { body },
                    Err(e) => Response::Error {
                        message: e.to_string(),
                    },
                },
                Err(e) => Response::Error {
                    message: format!("malformed request: {e}"),
                },
            };

            let mut encoded = serde_json::to_string(&response)?;
            encoded.push('\n');
            write_half.write_all(encoded.as_bytes()).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Option<ResponseBody>, ControlError> {
        match request {
            Request::Health => Ok(Some(ResponseBody::Health { healthy: true })),
            Request::Status => Ok(Some(ResponseBody::Status {
                healthy: true,
                proxies: self.service.list_proxies(),
            })),
            Request::Stop => {
                warn!("stop requested over the control plane");
                let _ = self.stop_tx.send(()).await;
                Ok(None)
            }
            Request::AddSshKey {
                encoded_key,
                passphrase,
            } => {
                self.service
                    .add_ssh_key(&encoded_key, passphrase.as_deref())?;
                Ok(None)
            }
            Request::ListKeys => Ok(Some(ResponseBody::Keys {
                keys: self.service.list_keys(),
            })),
            Request::StartProxy { kind, params } => {
                let proxy = self.service.start_proxy(kind, &params).await?;
                Ok(Some(ResponseBody::Proxy { proxy }))
            }
            Request::ListProxies => Ok(Some(ResponseBody::Proxies {
                proxies: self.service.list_proxies(),
            })),
            Request::AddDialer { name, uri } => {
                self.service.add_dialer(name.as_deref(), &uri)?;
                Ok(None)
            }
            Request::ListDialers => Ok(Some(ResponseBody::Dialers {
                dialers: self.service.list_dialers(),
            })),
            Request::Connect { id, passphrase } => {
                let progress = self.connect(id, passphrase).await?;
                Ok(Some(ResponseBody::Connect(progress)))
            }
            Request::AddRule { cidr, dialer } => {
                self.service.add_rule(&cidr, &dialer)?;
                Ok(None)
            }
            Request::ListRules => Ok(Some(ResponseBody::Rules {
                rules: self.service.list_rules(),
            })),
        }
    }

    /// One step of the interactive connect cycle.
    ///
    /// Blocks until there is something to report: new messages, a terminal
    /// state, or a passphrase prompt.
    async fn connect(
        &self,
        id: Option<String>,
        passphrase: Option<String>,
    ) -> Result<ConnectProgress, ControlError> {
        self.sessions
            .retain(|_, session| session.last_activity.elapsed() < SESSION_IDLE_LIMIT);

        let (id, connector, mut cursor) = match id {
            Some(id) => {
                let session = self
                    .sessions
                    .get(&id)
                    .ok_or_else(|| ControlError::UnknownSession(id.clone()))?;
                (id.clone(), Arc::clone(&session.connector), session.cursor)
            }
            None => {
                let connector = self.service.interactive_connector();
                let id = Uuid::new_v4().to_string();
                self.sessions.insert(
                    id.clone(),
                    ConnectSession {
                        connector: Arc::clone(&connector),
                        cursor: 0,
                        last_activity: Instant::now(),
                    },
                );
                debug!("started connect session {id}");
                (id, connector, 0)
            }
        };

        if let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) {
            connector.set_passphrase(&passphrase)?;
        }

        let mut messages = Vec::new();
        loop {
            while cursor < connector.message_count() {
                if let Some(message) = connector.message(cursor) {
                    messages.push(message);
                }
                cursor += 1;
            }
            if !messages.is_empty()
                || connector.done()
                || connector.status() == ConnectStatus::NeedPassphrase
            {
                break;
            }
            connector.wait().await;
        }

        let status = connector.status();
        if status.is_terminal() {
            // The cycle ends here; a fresh call starts a new attempt.
            self.sessions.remove(&id);
        } else if let Some(mut session) = self.sessions.get_mut(&id) {
            session.cursor = cursor;
            session.last_activity = Instant::now();
        }

        Ok(ConnectProgress {
            id,
            status,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::control::ControlClient;
    use crate::proxy::ProxyKind;
    use crate::service::TunnelService;
    use crate::ssh::SshDialerConfig;

    use super::*;

    async fn start_server() -> (ControlClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let service = TunnelService::new(SshDialerConfig {
            connect_timeout: Duration::from_secs(1),
            passphrase_timeout: None,
        });
        let (server, stop_rx) = ControlServer::new(service);
        tokio::spawn(server.serve(listener, stop_rx));

        (ControlClient::new(path), dir)
    }

    #[tokio::test]
    async fn health_round_trip() {
        let (client, _dir) = start_server().await;
        assert!(client.health().await.unwrap());
    }

    #[tokio::test]
    async fn rules_round_trip() {
        let (client, _dir) = start_server().await;
        client.add_rule("10.0.0.0/8", "default").await.unwrap();
        client.add_rule("192.168.0.0/16", "lan").await.unwrap();
        client.add_rule("10.0.0.0/8", "tunnel").await.unwrap();

        let rules = client.list_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].cidr, "10.0.0.0/8");
        assert_eq!(rules[0].dialer, "tunnel");
        assert_eq!(rules[1].dialer, "lan");
    }

    #[tokio::test]
    async fn invalid_rule_reports_an_error() {
        let (client, _dir) = start_server().await;
        let err = client.add_rule("not-a-cidr", "x").await.unwrap_err();
        assert!(matches!(err, ControlError::Remote(message) if message.contains("not-a-cidr")));
    }

    #[tokio::test]
    async fn dialers_round_trip() {
        let (client, _dir) = start_server().await;
        client
            .add_dialer(None, "socks5://127.0.0.1:9050")
            .await
            .unwrap();
        let dialers = client.list_dialers().await.unwrap();
        assert_eq!(dialers.len(), 1);
        assert_eq!(dialers[0].destination, "127.0.0.1:9050");
    }

    #[tokio::test]
    async fn proxies_round_trip() {
        let (client, _dir) = start_server().await;
        let proxy = client.start_proxy(ProxyKind::Http, "").await.unwrap();
        assert_ne!(proxy.port, 0);

        let status = client.status().await.unwrap();
        let (healthy, proxies) = status;
        assert!(healthy);
        assert_eq!(proxies.len(), 1);
    }

    #[tokio::test]
    async fn interactive_connect_cycle_reports_progress() {
        // With no ssh targets configured the attempt fails immediately, but
        // the cycle must still hand out an id, deliver the progress message
        // and end in a terminal state.
        let (client, _dir) = start_server().await;

        let first = client.connect(None, None).await.unwrap();
        assert!(!first.id.is_empty());

        let mut progress = first;
        let mut all_messages = progress.messages.clone();
        while !progress.status.is_terminal() {
            progress = client.connect(Some(progress.id.clone()), None).await.unwrap();
            all_messages.extend(progress.messages.iter().cloned());
        }

        assert_eq!(progress.status, ConnectStatus::Failed);
        assert!(
            all_messages.iter().any(|m| m.contains("No ssh targets")),
            "expected the no-targets message, got {all_messages:?}"
        );

        // The session is gone after the terminal poll.
        let err = client
            .connect(Some(progress.id.clone()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Remote(message) if message.contains("no connect session")));
    }

    #[tokio::test]
    async fn stop_terminates_the_accept_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let service = TunnelService::new(SshDialerConfig::default());
        let (server, stop_rx) = ControlServer::new(service);
        let serve = tokio::spawn(server.serve(listener, stop_rx));

        let client = ControlClient::new(path);
        client.stop().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve must return after stop")
            .unwrap();
    }
}
