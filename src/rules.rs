//! CIDR routing rules.
//!
//! A [`RuleSet`] is an ordered list of CIDR → dialer-name bindings. Lookup is
//! first-match in insertion order - deliberately not longest-prefix - and a
//! destination that matches no rule (or cannot be resolved) falls back to a
//! direct system dial: routing trouble must never block connectivity
//! outright.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::dialer::{DialError, DialStream, Dialer, DialerRegistry, DirectDialer};

#[derive(Error, Debug, Clone)]
pub enum RuleError {
    #[error("'{0}' is not a valid CIDR")]
    InvalidCidr(String),
}

/// Binds a CIDR range to a dialer name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub net: IpNet,
    pub dialer: String,
}

impl Rule {
    /// Parses `cidr` and binds it to `dialer`; an empty dialer name means
    /// `"default"`.
    pub fn new(cidr: &str, dialer: &str) -> Result<Self, RuleError> {
        let net: IpNet = cidr
            .parse()
            .map_err(|_| RuleError::InvalidCidr(cidr.to_string()))?;
        let dialer = if dialer.is_empty() {
            "default".to_string()
        } else {
            dialer.to_string()
        };
        Ok(Self { net, dialer })
    }
}

/// Wire/listing form of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInfo {
    pub cidr: String,
    pub dialer: String,
}

impl From<&Rule> for RuleInfo {
    fn from(rule: &Rule) -> Self {
        Self {
            cidr: rule.net.to_string(),
            dialer: rule.dialer.clone(),
        }
    }
}

/// Named, ordered rule collection. Owns no dialers; it only names them and
/// resolves through the injected registry.
pub struct RuleSet {
    name: String,
    registry: Arc<DialerRegistry>,
    rules: RwLock<Vec<Rule>>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, registry: Arc<DialerRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a rule. If the CIDR range is already present the existing rule is
    /// replaced in place, keeping its position in the lookup order.
    pub fn add_rule(&self, rule: Rule) {
        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter_mut().find(|r| r.net == rule.net) {
            *existing = rule;
            return;
        }
        rules.push(rule);
    }

    /// Snapshot of the rules in insertion order.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    fn match_dialer(&self, ip: IpAddr) -> Option<String> {
        self.rules
            .read()
            .iter()
            .find(|rule| rule.net.contains(&ip))
            .map(|rule| rule.dialer.clone())
    }

    /// Dials `addr` through the dialer of the first matching rule, falling
    /// back to a direct dial when nothing matches or resolution fails.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<DialStream, DialError> {
        match resolve_ip(addr).await {
            Some(ip) => match self.match_dialer(ip) {
                Some(dialer) => {
                    debug!("rule set {}: {addr} -> dialer '{dialer}'", self.name);
                    return self.registry.dial(&dialer, network, addr).await;
                }
                None => debug!("rule set {}: no rule for {addr}, dialing direct", self.name),
            },
            None => debug!(
                "rule set {}: cannot resolve {addr}, dialing direct",
                self.name
            ),
        }
        DirectDialer.dial(network, addr).await
    }
}

#[async_trait]
impl Dialer for RuleSet {
    async fn dial(&self, network: &str, addr: &str) -> Result<DialStream, DialError> {
        RuleSet::dial(self, network, addr).await
    }
}

async fn resolve_ip(addr: &str) -> Option<IpAddr> {
    tokio::net::lookup_host(addr)
        .await
        .ok()?
        .next()
        .map(|socket_addr| socket_addr.ip())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::dialer::DialerKind;

    use super::*;

    /// Dialer that records how often it was picked and hands out one side of
    /// an in-memory pipe.
    struct CountingDialer {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, _network: &str, _addr: &str) -> Result<DialStream, DialError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let (ours, _theirs) = tokio::io::duplex(16);
            Ok(Box::new(ours))
        }
    }

    fn counting(registry: &DialerRegistry, name: &str) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(
            name,
            DialerKind::Socks5,
            name,
            Arc::new(CountingDialer { hits: hits.clone() }),
        );
        hits
    }

    #[test]
    fn duplicate_cidr_replaces_in_place() {
        let rules = RuleSet::new("test", Arc::new(DialerRegistry::new()));
        rules.add_rule(Rule::new("10.0.0.0/8", "first").unwrap());
        rules.add_rule(Rule::new("192.168.0.0/16", "second").unwrap());
        rules.add_rule(Rule::new("10.0.0.0/8", "replacement").unwrap());

        let snapshot = rules.rules();
        assert_eq!(snapshot.len(), 2);
        // Position preserved, newest dialer name wins.
        assert_eq!(snapshot[0].net.to_string(), "10.0.0.0/8");
        assert_eq!(snapshot[0].dialer, "replacement");
        assert_eq!(snapshot[1].dialer, "second");
    }

    #[test]
    fn empty_dialer_name_defaults() {
        let rule = Rule::new("10.0.0.0/8", "").unwrap();
        assert_eq!(rule.dialer, "default");
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        assert!(matches!(
            Rule::new("not-a-cidr", "x"),
            Err(RuleError::InvalidCidr(_))
        ));
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let registry = Arc::new(DialerRegistry::new());
        let broad_hits = counting(&registry, "broad");
        let narrow_hits = counting(&registry, "narrow");

        let rules = RuleSet::new("test", registry);
        // The broader rule is inserted first and must win even though the
        // narrower one also matches.
        rules.add_rule(Rule::new("10.0.0.0/8", "broad").unwrap());
        rules.add_rule(Rule::new("10.1.0.0/16", "narrow").unwrap());

        rules.dial("tcp", "10.1.2.3:443").await.unwrap();
        assert_eq!(broad_hits.load(Ordering::SeqCst), 1);
        assert_eq!(narrow_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_address_dials_direct() {
        let registry = Arc::new(DialerRegistry::new());
        let tunnel_hits = counting(&registry, "tunnel");

        let rules = RuleSet::new("test", registry);
        rules.add_rule(Rule::new("10.0.0.0/8", "tunnel").unwrap());

        // A loopback listener stands in for "the system network".
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"ok").await.unwrap();
        });

        let mut stream = rules.dial("tcp", &addr.to_string()).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        assert_eq!(tunnel_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matching_rule_with_unknown_dialer_errors() {
        let rules = RuleSet::new("test", Arc::new(DialerRegistry::new()));
        rules.add_rule(Rule::new("127.0.0.0/8", "ghost").unwrap());

        let err = rules.dial("tcp", "127.0.0.1:9").await.err().unwrap();
        assert!(matches!(err, DialError::UnknownDialer(name) if name == "ghost"));
    }
}
