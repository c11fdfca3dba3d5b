//! # assuan
//!
//! A line-oriented, bidirectional request/response protocol core for
//! security-sensitive helper processes talking over pipes or local stream
//! sockets: commands, inline data payloads, out-of-band status updates,
//! inquiries back to the client, and — on POSIX transports — ancillary
//! file descriptor passing.
//!
//! This crate is the protocol core only. It does not decide what any
//! particular command *means*; it gets a command line to a registered
//! handler and a handler's output back onto the wire, correctly framed.
//! See [`server`] for the command-dispatching side and [`client`] for the
//! command-issuing side.

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod message;
pub mod server;
pub mod transport;
pub mod vtable;

pub use client::transact;
pub use context::{Context, Role};
pub use error::{Error, ErrorCode, Result};
pub use message::Message;
pub use server::process;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
