//! Remote command server and client.
//!
//! Line-oriented JSON over TCP: one request object per line, one response line per request.
//! See [`protocol`] for the message shapes.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ErrorHandling, RpcClient};
pub use protocol::{RpcRequest, ERROR_PREFIX, SUCCESS};
pub use server::RpcServer;
