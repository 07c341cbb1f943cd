//! Named session-management sockets (C3), the per-child RPC channel and
//! client (C4, C5), and the controller registry (C6).

mod channel;
mod client;
mod controller;
mod error;
mod named_socket;

pub use channel::{RpcChannel, SubscriptionId};
pub use client::{Client, ClientEventSink};
pub use controller::Controller;
pub use error::{Error, Result};
pub use named_socket::NamedSocket;
