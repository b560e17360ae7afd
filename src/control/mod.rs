//! Control plane.
//!
//! The daemon is configured at runtime over a local Unix socket speaking
//! line-delimited JSON: keys, dialer targets, routing rules, proxy
//! front-ends, and the interactive connect cycle that streams handshake
//! progress (and passphrase prompts) to a client process.

mod api;
mod client;
mod server;

pub use api::{ConnectProgress, Request, Response, ResponseBody};
pub use client::ControlClient;
pub use server::{ControlError, ControlServer};
