use serde::{Deserialize, Serialize};

use crate::config::{MaxResourceCapabilities, SocketLocation, SocketPermissions};
use crate::logging::LoggingLevels;
use crate::state::SessionServerState;

/// `SetConfiguration` request: binds a (possibly preloaded) child to an
/// application. Carries either a socket name or a handed-over fd, never
/// both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfigurationRequest {
    pub initial_state: SessionServerState,
    pub socket: SocketLocation,
    pub socket_permissions: SocketPermissions,
    pub client_display_name: String,
    pub max_resources: MaxResourceCapabilities,
    pub app_name: String,
    pub current_log_levels: LoggingLevels,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigurationResponse;

/// `SetState` request: asks the child to transition to a new run-state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub new_state: SessionServerState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetStateResponse;

/// `Ping` request: a healthcheck liveness probe identified by a monotonic
/// round id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingRequest {
    pub ping_id: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse;

/// `SetLogLevels` request: updates per-component log verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLogLevelsRequest {
    pub levels: LoggingLevels,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetLogLevelsResponse;

/// The full request schema carried by one call on the RPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    SetConfiguration(SetConfigurationRequest),
    SetState(SetStateRequest),
    Ping(PingRequest),
    SetLogLevels(SetLogLevelsRequest),
}

/// The full response schema, paired one-to-one with `Request` variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    SetConfiguration(SetConfigurationResponse),
    SetState(SetStateResponse),
    Ping(PingResponse),
    SetLogLevels(SetLogLevelsResponse),
}

/// `StateChanged` event: the child reporting its own new run-state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub new_state: SessionServerState,
}

/// `Ack` event: the child's asynchronous reply to a `Ping`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AckEvent {
    pub ping_id: i32,
    pub success: bool,
}

/// Unsolicited frames a child may send at any time, fanned out to channel
/// subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Event {
    StateChanged(StateChangedEvent),
    Ack(AckEvent),
}
