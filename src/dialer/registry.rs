//! Name → dialer registry.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{DialError, DialStream, Dialer};

/// What kind of transport backs a registered dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialerKind {
    Ssh,
    Socks5,
}

impl std::fmt::Display for DialerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialerKind::Ssh => f.write_str("ssh"),
            DialerKind::Socks5 => f.write_str("socks5"),
        }
    }
}

/// Registry listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DialerKind,
    pub destination: String,
}

struct Registered {
    kind: DialerKind,
    destination: String,
    dialer: Arc<dyn Dialer>,
}

/// Shared name → dialer mapping. Registering an existing name replaces the
/// implementation; every caller sees the replacement on its next lookup.
#[derive(Default)]
pub struct DialerRegistry {
    entries: DashMap<String, Registered>,
}

impl DialerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        kind: DialerKind,
        destination: impl Into<String>,
        dialer: Arc<dyn Dialer>,
    ) {
        self.entries.insert(
            name.to_string(),
            Registered {
                kind,
                destination: destination.into(),
                dialer,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Dialer>> {
        self.entries.get(name).map(|entry| Arc::clone(&entry.dialer))
    }

    /// Dials through the named dialer.
    ///
    /// An unknown name is an explicit error, never a silent no-op: a rule
    /// naming a missing dialer should fail loudly, not hand back a dead
    /// connection.
    pub async fn dial(
        &self,
        name: &str,
        network: &str,
        addr: &str,
    ) -> Result<DialStream, DialError> {
        let dialer = self
            .get(name)
            .ok_or_else(|| DialError::UnknownDialer(name.to_string()))?;
        dialer.dial(network, addr).await
    }

    /// All entries, sorted by name for stable listings.
    pub fn list(&self) -> Vec<DialerInfo> {
        let mut infos: Vec<DialerInfo> = self
            .entries
            .iter()
            .map(|entry| DialerInfo {
                name: entry.key().clone(),
                kind: entry.kind,
                destination: entry.destination.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
