//! SSH target address parsing.
//!
//! A target is written as `ssh://[user@]host[:port]`; the scheme may be
//! omitted. The port defaults to 22. IPv6 hosts use the usual bracket form,
//! `ssh://user@[::1]:2222`.

use std::fmt;

use super::error::SshError;

/// One SSH endpoint out of a dialer's ordered fallback list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAddress {
    /// User to authenticate as; falls back to the dialer default, then to the
    /// local username.
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl SshAddress {
    /// The effective user for this address given the dialer-wide default.
    pub fn effective_user(&self, default_user: Option<&str>) -> String {
        self.user
            .clone()
            .or_else(|| default_user.map(str::to_string))
            .unwrap_or_else(whoami::username)
    }
}

impl fmt::Display for SshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}:{}", user, self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Parses a single `ssh://[user@]host[:port]` target.
///
/// Accepts the bare `[user@]host[:port]` form as well; any scheme other than
/// `ssh` is rejected.
pub fn parse_ssh_address(uri: &str) -> Result<SshAddress, SshError> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(SshError::InvalidUri(uri.to_string()));
    }

    let rest = match trimmed.split_once("://") {
        Some(("ssh", rest)) => rest,
        Some(_) => return Err(SshError::InvalidUri(uri.to_string())),
        None => trimmed,
    };

    let (user, host_port) = match rest.rsplit_once('@') {
        Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
        Some((_, host_port)) => (None, host_port),
        None => (None, rest),
    };

    let (host, port) = split_host_port(host_port, uri)?;
    if host.is_empty() {
        return Err(SshError::InvalidUri(uri.to_string()));
    }

    Ok(SshAddress { user, host, port })
}

fn split_host_port(host_port: &str, uri: &str) -> Result<(String, u16), SshError> {
    // Bracketed IPv6 literal
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| SshError::InvalidUri(uri.to_string()))?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(port, uri)?)),
            None if after.is_empty() => Ok((host.to_string(), 22)),
            None => Err(SshError::InvalidUri(uri.to_string())),
        };
    }

    match host_port.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal without a port.
        Some((head, _)) if head.contains(':') => Ok((host_port.to_string(), 22)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port, uri)?)),
        None => Ok((host_port.to_string(), 22)),
    }
}

fn parse_port(port: &str, uri: &str) -> Result<u16, SshError> {
    port.parse::<u16>()
        .map_err(|_| SshError::InvalidUri(uri.to_string()))
}
