//! Control client.
//!
//! Thin typed wrapper over the line-JSON control socket, used by a separate
//! client process (and the tests) to configure and drive the daemon.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::dialer::DialerInfo;
use crate::proxy::{ProxyInfo, ProxyKind};
use crate::rules::RuleInfo;
use crate::ssh::SshKeyInfo;

use super::api::{ConnectProgress, Request, Response, ResponseBody};
use super::server::ControlError;

/// Client side of the control socket.
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sends one request and reads one response.
    pub async fn request(&self, request: &Request) -> Result<Option<ResponseBody>, ControlError> {
        let stream = UnixStream::connect(&self.path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        BufReader::new(read_half).read_line(&mut reply).await?;

        match serde_json::from_str::<Response>(&reply)? {
            Response::Ok { body } => Ok(body),
            Response::Error { message } => Err(ControlError::Remote(message)),
        }
    }

    pub async fn health(&self) -> Result<bool, ControlError> {
        match self.request(&Request::Health).await? {
            Some(ResponseBody::Health { healthy }) => Ok(healthy),
            _ => Ok(false),
        }
    }

    pub async fn status(&self) -> Result<(bool, Vec<ProxyInfo>), ControlError> {
        match self.request(&Request::Status).await? {
            Some(ResponseBody::Status { healthy, proxies }) => Ok((healthy, proxies)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        self.request(&Request::Stop).await?;
        Ok(())
    }

    pub async fn add_ssh_key(
        &self,
        encoded_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), ControlError> {
        self.request(&Request::AddSshKey {
            encoded_key: encoded_key.to_string(),
            passphrase: passphrase.map(str::to_string),
        })
        .await?;
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<SshKeyInfo>, ControlError> {
        match self.request(&Request::ListKeys).await? {
            Some(ResponseBody::Keys { keys }) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    pub async fn start_proxy(
        &self,
        kind: ProxyKind,
        params: &str,
    ) -> Result<ProxyInfo, ControlError> {
        match self
            .request(&Request::StartProxy {
                kind,
                params: params.to_string(),
            })
            .await?
        {
            Some(ResponseBody::Proxy { proxy }) => Ok(proxy),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_proxies(&self) -> Result<Vec<ProxyInfo>, ControlError> {
        match self.request(&Request::ListProxies).await? {
            Some(ResponseBody::Proxies { proxies }) => Ok(proxies),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_dialer(&self, name: Option<&str>, uri: &str) -> Result<(), ControlError> {
        self.request(&Request::AddDialer {
            name: name.map(str::to_string),
            uri: uri.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn list_dialers(&self) -> Result<Vec<DialerInfo>, ControlError> {
        match self.request(&Request::ListDialers).await? {
            Some(ResponseBody::Dialers { dialers }) => Ok(dialers),
            other => Err(unexpected(other)),
        }
    }

    /// One poll of the interactive connect cycle.
    pub async fn connect(
        &self,
        id: Option<String>,
        passphrase: Option<&str>,
    ) -> Result<ConnectProgress, ControlError> {
        match self
            .request(&Request::Connect {
                id,
                passphrase: passphrase.map(str::to_string),
            })
            .await?
        {
            Some(ResponseBody::Connect(progress)) => Ok(progress),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_rule(&self, cidr: &str, dialer: &str) -> Result<(), ControlError> {
        self.request(&Request::AddRule {
            cidr: cidr.to_string(),
            dialer: dialer.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn list_rules(&self) -> Result<Vec<RuleInfo>, ControlError> {
        match self.request(&Request::ListRules).await? {
            Some(ResponseBody::Rules { rules }) => Ok(rules),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(body: Option<ResponseBody>) -> ControlError {
    ControlError::Remote(format!("unexpected response body: {body:?}"))
}
