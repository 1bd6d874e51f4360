//! Text-broadcast chat relay over TCP.
//!
//! Every participant's message is delivered to every connected participant,
//! in the order the relay received it. Messages travel as length-prefixed
//! frames because TCP preserves bytes, not message boundaries.
//!
//! - [`codec`] reads and writes frames over any async byte stream.
//! - [`protocol`] holds the fixed wire texts and nickname rules.
//! - [`session`] is one named participant and its write handle.
//! - [`registry`] is the lock-guarded set of live sessions.
//! - [`broadcast`] fans a frame out to a registry snapshot and evicts
//!   unreachable recipients.
//! - [`handler`] drives one connection from handshake to disconnect.
//! - [`server`] owns the listener, spawns handlers and shuts them all down.
//! - [`cli`], [`config`] and [`client`] make up the binary.
//!
//! Integration tests drive the relay over loopback TCP and through the
//! compiled binary.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use error::{RelayError, RelayResult};
