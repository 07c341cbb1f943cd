//! The per-child client (C5): a typed service stub wrapping an
//! `RpcChannel`, dispatching incoming `StateChanged`/`Ack` events into the
//! supervisor re-tagged with this client's `ServerId`.

use std::os::fd::RawFd;
use std::sync::Arc;

use ssm_protocol::{
    AppConfig, Event, LoggingLevels, MaxResourceCapabilities, PingRequest, Request, ServerId,
    SessionServerState, SetConfigurationRequest, SetLogLevelsRequest, SetStateRequest,
    SocketLocation, SocketPermissions,
};

use crate::channel::RpcChannel;

/// Callback surface the supervisor implements to receive child-initiated
/// events.
pub trait ClientEventSink: Send + Sync {
    fn on_state_changed(&self, server_id: ServerId, new_state: SessionServerState);
    fn on_ack(&self, server_id: ServerId, ping_id: i32, success: bool);
}

pub struct Client {
    server_id: ServerId,
    channel: Arc<RpcChannel>,
}

impl Client {
    /// Takes ownership of `fd` (already connected) and wires the channel's
    /// event subscription to `sink`.
    pub fn connect<S, D>(server_id: ServerId, fd: RawFd, sink: Arc<S>, on_disconnected: D) -> Self
    where
        S: ClientEventSink + 'static,
        D: FnOnce() + Send + 'static,
    {
        let channel = RpcChannel::new(fd, on_disconnected);
        channel.subscribe(move |event| match event {
            Event::StateChanged(e) => sink.on_state_changed(server_id, e.new_state),
            Event::Ack(e) => sink.on_ack(server_id, e.ping_id, e.success),
        });
        Client { server_id, channel }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// `true` iff the call round-tripped without an RPC-layer error; the
    /// semantic outcome arrives later as a `StateChanged` event.
    pub fn perform_set_configuration(
        &self,
        initial_state: SessionServerState,
        app_name: &str,
        config: &AppConfig,
        socket_permissions: SocketPermissions,
        max_resources: MaxResourceCapabilities,
        current_log_levels: LoggingLevels,
    ) -> bool {
        let socket = config
            .session_management_socket
            .clone()
            .unwrap_or_else(|| SocketLocation::Path(String::new()));
        let request = Request::SetConfiguration(SetConfigurationRequest {
            initial_state,
            socket,
            socket_permissions,
            client_display_name: config.client_display_name.clone(),
            max_resources,
            app_name: app_name.to_string(),
            current_log_levels,
        });
        self.channel.call(request).is_ok()
    }

    pub fn perform_set_state(&self, new_state: SessionServerState) -> bool {
        self.channel
            .call(Request::SetState(SetStateRequest { new_state }))
            .is_ok()
    }

    pub fn perform_ping(&self, ping_id: i32) -> bool {
        self.channel
            .call(Request::Ping(PingRequest { ping_id }))
            .is_ok()
    }

    pub fn set_log_levels(&self, levels: LoggingLevels) -> bool {
        self.channel
            .call(Request::SetLogLevels(SetLogLevelsRequest { levels }))
            .is_ok()
    }

    pub fn disconnect(&self) {
        self.channel.disconnect();
    }
}
