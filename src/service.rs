//! Service wiring.
//!
//! [`TunnelService`] owns the dialer registry, the rule set, the default SSH
//! dialer and the running front-ends, and is injected into whatever drives
//! them (the control server, tests). There is no process-global state.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

use crate::dialer::{DialerInfo, DialerKind, DialerRegistry, Socks5Dialer};
use crate::proxy::{
    HttpProxy, Proxy, ProxyError, ProxyInfo, ProxyKind, Socks5Proxy, TcpProxy,
};
use crate::rules::{Rule, RuleError, RuleInfo, RuleSet};
use crate::ssh::{SshConnector, SshDialer, SshDialerConfig, SshError, SshKeyInfo};

/// Name under which the process SSH dialer is registered.
pub const DEFAULT_DIALER: &str = "default";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// The daemon's component graph.
pub struct TunnelService {
    registry: Arc<DialerRegistry>,
    rules: Arc<RuleSet>,
    ssh_config: SshDialerConfig,
    /// Concrete handles to SSH dialers for configuration calls; the registry
    /// holds the same instances as `dyn Dialer` for routing.
    ssh_dialers: DashMap<String, SshDialer>,
    proxies: RwLock<Vec<ProxyEntry>>,
}

struct ProxyEntry {
    info: ProxyInfo,
    // Keeps set_dialer reachable; the accept loop runs detached.
    #[allow(dead_code)]
    proxy: Box<dyn Proxy>,
}

impl TunnelService {
    pub fn new(ssh_config: SshDialerConfig) -> Arc<Self> {
        let registry = Arc::new(DialerRegistry::new());
        let rules = Arc::new(RuleSet::new("default", Arc::clone(&registry)));
        Arc::new(Self {
            registry,
            rules,
            ssh_config,
            ssh_dialers: DashMap::new(),
            proxies: RwLock::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Arc<DialerRegistry> {
        &self.registry
    }

    pub fn rules(&self) -> &Arc<RuleSet> {
        &self.rules
    }

    /// The process SSH dialer, created on first use.
    pub fn default_ssh_dialer(&self) -> SshDialer {
        self.ssh_dialer(DEFAULT_DIALER)
    }

    fn ssh_dialer(&self, name: &str) -> SshDialer {
        self.ssh_dialers
            .entry(name.to_string())
            .or_insert_with(|| SshDialer::new(self.ssh_config.clone()))
            .clone()
    }

    /// Registers a key with the default SSH dialer.
    pub fn add_ssh_key(&self, encoded: &str, passphrase: Option<&str>) -> Result<(), ServiceError> {
        self.default_ssh_dialer().add_ssh_key(encoded, passphrase)?;
        Ok(())
    }

    pub fn list_keys(&self) -> Vec<SshKeyInfo> {
        self.default_ssh_dialer().list_keys()
    }

    /// Configures a dialer target.
    ///
    /// `socks5://host:port` registers a SOCKS5-backed dialer. Anything else
    /// is treated as one or more (comma-separated) `ssh://` targets appended
    /// to the named SSH dialer.
    pub fn add_dialer(&self, name: Option<&str>, uri: &str) -> Result<(), ServiceError> {
        let name = name.unwrap_or(DEFAULT_DIALER);

        if let Some(addr) = uri.strip_prefix("socks5://") {
            info!("registering socks5 dialer '{name}' -> {addr}");
            self.registry.register(
                name,
                DialerKind::Socks5,
                addr.to_string(),
                Arc::new(Socks5Dialer::new(addr.to_string())),
            );
            return Ok(());
        }

        let dialer = self.ssh_dialer(name);
        for target in uri.split(',') {
            dialer.add_target(target)?;
        }
        info!("ssh dialer '{name}' targets: {}", dialer.destination());
        // Register (or refresh the destination of) the routing entry.
        self.registry.register(
            name,
            DialerKind::Ssh,
            dialer.destination(),
            Arc::new(dialer),
        );
        Ok(())
    }

    pub fn list_dialers(&self) -> Vec<DialerInfo> {
        self.registry.list()
    }

    /// The in-flight (or a fresh) connection attempt of the default SSH
    /// dialer, for the interactive connect cycle.
    pub fn interactive_connector(&self) -> Arc<SshConnector> {
        self.default_ssh_dialer().connector(true)
    }

    pub fn add_rule(&self, cidr: &str, dialer: &str) -> Result<(), ServiceError> {
        let rule = Rule::new(cidr, dialer)?;
        info!("adding rule {} -> '{}'", rule.net, rule.dialer);
        self.rules.add_rule(rule);
        Ok(())
    }

    pub fn list_rules(&self) -> Vec<RuleInfo> {
        self.rules.rules().iter().map(RuleInfo::from).collect()
    }

    /// Starts a front-end. `params` is the requested port; empty means
    /// ephemeral.
    pub async fn start_proxy(
        &self,
        kind: ProxyKind,
        params: &str,
    ) -> Result<ProxyInfo, ServiceError> {
        let port: u16 = if params.is_empty() {
            0
        } else {
            params
                .parse()
                .map_err(|_| ProxyError::InvalidParams(params.to_string()))?
        };

        let dialer: Arc<dyn crate::dialer::Dialer> = Arc::clone(&self.rules) as _;
        let proxy: Box<dyn Proxy> = match kind {
            ProxyKind::Tcp => Box::new(TcpProxy::start(port, dialer).await?),
            ProxyKind::Socks5 => Box::new(Socks5Proxy::start(port, dialer).await?),
            ProxyKind::Http => Box::new(HttpProxy::start(port, dialer).await?),
        };

        let info = ProxyInfo {
            kind,
            port: proxy.port(),
            params: params.to_string(),
        };
        info!("started {kind} proxy on port {}", info.port);
        self.proxies.write().push(ProxyEntry {
            info: info.clone(),
            proxy,
        });
        Ok(info)
    }

    pub fn list_proxies(&self) -> Vec<ProxyInfo> {
        self.proxies
            .read()
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }
}
