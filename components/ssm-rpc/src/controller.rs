//! Registry of per-child clients (C6): a synchronous `perform_x(id, ...)
//! -> bool` facade over the set of `Client`s, indexed by `ServerId`.
//! Guarded by one mutex, since `send_ping_events` iterates it from the
//! event thread while a channel thread may concurrently fail and call
//! `remove_client` indirectly.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use ssm_protocol::{
    AppConfig, LoggingLevels, MaxResourceCapabilities, ServerId, SessionServerState,
    SocketPermissions,
};

use crate::client::{Client, ClientEventSink};

#[derive(Default)]
pub struct Controller {
    clients: Mutex<HashMap<ServerId, Arc<Client>>>,
}

impl Controller {
    pub fn new() -> Self {
        Controller::default()
    }

    /// Builds a client on `fd` and registers it. Returns `false` if `id`
    /// already has a client; takes ownership of `fd` either way.
    pub fn create_client<S, D>(
        &self,
        id: ServerId,
        fd: RawFd,
        sink: Arc<S>,
        on_disconnected: D,
    ) -> bool
    where
        S: ClientEventSink + 'static,
        D: FnOnce() + Send + 'static,
    {
        let mut clients = self.clients.lock();
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(id, Arc::new(Client::connect(id, fd, sink, on_disconnected)));
        true
    }

    /// Idempotent.
    pub fn remove_client(&self, id: ServerId) {
        if let Some(client) = self.clients.lock().remove(&id) {
            client.disconnect();
        }
    }

    pub fn perform_set_configuration(
        &self,
        id: ServerId,
        initial_state: SessionServerState,
        app_name: &str,
        config: &AppConfig,
        socket_permissions: SocketPermissions,
        max_resources: MaxResourceCapabilities,
        current_log_levels: LoggingLevels,
    ) -> bool {
        match self.client(id) {
            Some(client) => client.perform_set_configuration(
                initial_state,
                app_name,
                config,
                socket_permissions,
                max_resources,
                current_log_levels,
            ),
            None => false,
        }
    }

    pub fn perform_set_state(&self, id: ServerId, state: SessionServerState) -> bool {
        self.client(id).is_some_and(|c| c.perform_set_state(state))
    }

    pub fn perform_ping(&self, id: ServerId, ping_id: i32) -> bool {
        self.client(id).is_some_and(|c| c.perform_ping(ping_id))
    }

    /// `true` iff *every* currently registered client accepts the new log
    /// levels. Every client is always called, even once one has failed.
    pub fn set_log_levels(&self, levels: LoggingLevels) -> bool {
        let clients: Vec<_> = self.clients.lock().values().cloned().collect();
        clients
            .into_iter()
            .map(|client| client.set_log_levels(levels.clone()))
            .fold(true, |all_ok, ok| all_ok && ok)
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.clients.lock().keys().copied().collect()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.clients.lock().contains_key(&id)
    }

    fn client(&self, id: ServerId) -> Option<Arc<Client>> {
        self.clients.lock().get(&id).cloned()
    }
}
