//! Wire-independent data model and RPC schema for the session server manager.
//!
//! This crate owns no I/O. It defines the plain types that `ssm-rpc` moves
//! across a channel and that `ssm-manager` reasons about: server identity,
//! run-state, app configuration, socket permissions, logging levels, and the
//! request/response/event schema of the per-child RPC protocol.

mod config;
mod id;
mod logging;
mod message;
mod state;

pub use config::{AppConfig, MaxResourceCapabilities, SocketLocation, SocketPermissions};
pub use id::ServerId;
pub use logging::{LogLevel, LoggingLevels};
pub use message::{
    AckEvent, Event, PingRequest, PingResponse, Request, Response, SetConfigurationRequest,
    SetConfigurationResponse, SetLogLevelsRequest, SetLogLevelsResponse, SetStateRequest,
    SetStateResponse, StateChangedEvent,
};
pub use state::SessionServerState;
