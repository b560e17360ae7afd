//! SSH error types

use thiserror::Error;

use super::connector::ConnectStatus;

/// Errors produced by the SSH dialer, connector and key handling.
///
/// All payloads are plain strings so the error can be cloned to every waiter
/// of a shared connection attempt.
#[derive(Error, Debug, Clone)]
pub enum SshError {
    #[error("failed to decode private key: {0}")]
    KeyDecode(String),

    #[error("invalid passphrase for encrypted private key")]
    BadPassphrase,

    #[error("'{0}' is not a valid ssh url")]
    InvalidUri(String),

    #[error("wrong status: expected {expected}, have {have}")]
    WrongState {
        expected: ConnectStatus,
        have: ConnectStatus,
    },

    #[error("connection failed: {0}")]
    Transport(String),

    #[error("channel open refused: {0}")]
    ChannelOpen(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("SSH agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH agent error: {0}")]
    Agent(String),

    #[error("not connected")]
    Disconnected,
}

impl SshError {
    /// A channel-open refusal means the transport itself is healthy and the
    /// remote end rejected the destination; reconnecting would not help.
    pub fn is_channel_open(&self) -> bool {
        matches!(self, SshError::ChannelOpen(_))
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Transport(err.to_string())
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::ChannelOpenFailure(reason) => {
                SshError::ChannelOpen(format!("{reason:?}"))
            }
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::Handshake(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_open_failures_are_classified() {
        let err = SshError::from(russh::Error::ChannelOpenFailure(
            russh::ChannelOpenFailure::ConnectFailed,
        ));
        assert!(err.is_channel_open());

        let err = SshError::from(russh::Error::Disconnect);
        assert!(!err.is_channel_open());
    }
}
