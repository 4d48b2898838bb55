//! Remote control protocol: wire format, command registry, sessions and
//! the client side.

pub mod client;
pub mod command;
pub mod connection;
pub mod wire;

pub use client::ControlClient;
pub use command::{CommandKind, CommandSpec, Request};
pub use connection::RemoteConnection;
