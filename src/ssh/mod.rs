//! SSH connection management.
//!
//! Built on russh. The pieces, bottom up:
//! - key decoding and agent access (`keys`, `agent`)
//! - a single-owner task per established transport (`controller`)
//! - the per-attempt handshake state machine (`connector`)
//! - the lazy-connecting, auto-reconnecting connection manager (`dialer`)

mod address;
mod agent;
mod connector;
mod controller;
mod dialer;
mod error;
mod keys;

pub use address::{parse_ssh_address, SshAddress};
pub use agent::{is_agent_available, SshAgentClient};
pub use connector::{ConnectStatus, SshConnector};
pub use controller::SshController;
pub use dialer::{SshDialer, SshDialerConfig};
pub use error::SshError;
pub use keys::{decode_private_key, SshKeyInfo};
