//! `SessionServerAppManager` (C9): the central state machine. Owns the
//! registry of `SessionServerApp`s and is the only thing that mutates it —
//! every public method, RPC-layer event, and timer firing becomes a task
//! posted onto the event thread (C10), turning concurrent external calls
//! into a linear sequence.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use ssm_core::{Os, TimerService};
use ssm_protocol::{
    AppConfig, LoggingLevels, MaxResourceCapabilities, ServerId, SessionServerState,
    SocketPermissions,
};
use ssm_rpc::{ClientEventSink, Controller};

use crate::app::SessionServerApp;
use crate::event_thread::EventThread;
use crate::healthcheck::{HealthcheckService, HealthcheckSupervisor};

/// Callback surface a controller implements to observe the states the
/// supervisor believes bound apps to be in. Never called for an empty
/// `app_name` (i.e. a preloaded, unconfigured app).
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, app_name: &str, state: SessionServerState);
}

/// Immutable configuration the manager is constructed with, mirroring the
/// recognized configuration-file keys.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub session_server_path: String,
    pub environment: Vec<(String, String)>,
    pub startup_timeout: Duration,
    pub healthcheck_interval: Duration,
    pub failures_before_recovery: u32,
    pub socket_permissions: SocketPermissions,
    pub max_resources: MaxResourceCapabilities,
    pub initial_log_levels: LoggingLevels,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            session_server_path: String::new(),
            environment: Vec::new(),
            startup_timeout: Duration::from_secs(5),
            healthcheck_interval: Duration::from_secs(0),
            failures_before_recovery: 3,
            socket_permissions: SocketPermissions::default(),
            max_resources: MaxResourceCapabilities::default(),
            initial_log_levels: LoggingLevels::default(),
        }
    }
}

/// The set of live `SessionServerApp`s, keyed by `ServerId` with a secondary
/// index by (non-empty) `AppName`. Lives entirely inside `Inner`, touched
/// only from tasks running on the event thread.
#[derive(Default)]
struct Registry {
    apps: HashMap<ServerId, SessionServerApp>,
    by_name: HashMap<String, ServerId>,
}

impl Registry {
    fn insert(&mut self, app: SessionServerApp) {
        let id = app.server_id();
        if !app.app_name().is_empty() {
            self.by_name.insert(app.app_name().to_string(), id);
        }
        self.apps.insert(id, app);
    }

    fn remove(&mut self, id: ServerId) -> Option<SessionServerApp> {
        let app = self.apps.remove(&id)?;
        if !app.app_name().is_empty() {
            self.by_name.remove(app.app_name());
        }
        Some(app)
    }

    fn by_id(&self, id: ServerId) -> Option<&SessionServerApp> {
        self.apps.get(&id)
    }

    fn by_id_mut(&mut self, id: ServerId) -> Option<&mut SessionServerApp> {
        self.apps.get_mut(&id)
    }

    fn id_by_name(&self, name: &str) -> Option<ServerId> {
        self.by_name.get(name).copied()
    }

    /// Registers `name` for an already-tracked app whose name was empty at
    /// `insert` time (a preloaded worker just bound by `configure()`). Must
    /// run in the same event-thread task that called `configure()`, so the
    /// secondary index never observes the app under its old (empty) name.
    fn bind_name(&mut self, id: ServerId, name: &str) {
        if !name.is_empty() {
            self.by_name.insert(name.to_string(), id);
        }
    }

    /// The first tracked app that is both preloaded and has a live RPC
    /// client connected to it.
    fn first_preloaded_connected(&self, controller: &Controller) -> Option<ServerId> {
        self.apps
            .values()
            .find(|app| app.is_preloaded() && app.is_connected() && controller.contains(app.server_id()))
            .map(|app| app.server_id())
    }

    fn ids(&self) -> Vec<ServerId> {
        self.apps.keys().copied().collect()
    }
}

/// Holds every piece of mutable or cross-thread-shared state, plus a weak
/// self-reference so trait-callback methods that only receive `&self` (from
/// the RPC controller or the healthcheck service) can still obtain an owned
/// `Arc<Inner>` to move into a posted closure.
struct Inner {
    self_weak: Mutex<Weak<Inner>>,
    os: Arc<dyn Os>,
    timers: TimerService,
    event_thread: EventThread,
    controller: Controller,
    healthcheck: Arc<HealthcheckService>,
    registry: Mutex<Registry>,
    observer: Mutex<Option<Arc<dyn StateObserver>>>,
    config: ManagerConfig,
}

impl Inner {
    fn me(&self) -> Arc<Inner> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("Inner outlives every Arc that could call back into it")
    }

    // ---- preload pool -----------------------------------------------

    fn preload_one(&self) {
        let os = Arc::clone(&self.os);
        let this = self.me();
        let server_id = ServerId::next();
        let result = SessionServerApp::launch_preloaded(
            server_id,
            os,
            &self.timers,
            &self.config.session_server_path,
            &self.config.environment,
            self.config.startup_timeout,
            move || this.startup_timeout_callback(server_id),
        );
        match result {
            Ok(app) => {
                let parent_fd = app.parent_fd();
                self.registry.lock().insert(app);
                if let Some(fd) = parent_fd {
                    self.connect_client(server_id, fd);
                }
            }
            Err(err) => {
                log::warn!("failed to launch a preloaded session server: {err}");
            }
        }
    }

    /// Spawns a bound app directly (the "cold start" path of
    /// `initiate_application`). Returns `true` iff both the spawn and the
    /// RPC connect succeeded.
    fn spawn_bound(
        &self,
        app_name: &str,
        state: SessionServerState,
        config: AppConfig,
    ) -> bool {
        let os = Arc::clone(&self.os);
        let this = self.me();
        let server_id = ServerId::next();
        let result = SessionServerApp::launch_bound(
            server_id,
            os,
            &self.timers,
            &self.config.session_server_path,
            &self.config.environment,
            self.config.startup_timeout,
            app_name,
            state,
            config,
            &self.config.socket_permissions,
            move || this.startup_timeout_callback(server_id),
        );
        match result {
            Ok(app) => {
                let parent_fd = app.parent_fd();
                self.registry.lock().insert(app);
                match parent_fd {
                    Some(fd) => self.connect_client(server_id, fd),
                    None => false,
                }
            }
            Err(err) => {
                log::warn!("failed to launch session server '{app_name}': {err}");
                false
            }
        }
    }

    /// Registers an RPC client for `server_id` on `fd`. `fd` is always
    /// freshly produced by a `SessionServerApp::launch_*` call, so
    /// `create_client` can only fail if this id was already registered,
    /// which never happens for a brand-new `ServerId`.
    fn connect_client(&self, server_id: ServerId, fd: std::os::fd::RawFd) -> bool {
        let this = self.me();
        let sink = self.me();
        let created = self.controller.create_client(server_id, fd, sink, move || {
            let inner = Arc::clone(&this);
            this.event_thread.post(move || inner.handle_disconnect(server_id));
        });
        if created {
            if let Some(app) = self.registry.lock().by_id_mut(server_id) {
                app.set_connected(true);
            }
        }
        created
    }

    fn startup_timeout_callback(&self, server_id: ServerId) {
        let inner = self.me();
        self.event_thread
            .post(move || inner.handle_startup_timeout(server_id));
    }

    fn handle_startup_timeout(&self, server_id: ServerId) {
        if self.registry.lock().by_id(server_id).is_none() {
            return;
        }
        log::warn!("session server {server_id} failed to start within its startup timeout");
        self.handle_state_changed(server_id, SessionServerState::Error);
        if let Some(app) = self.registry.lock().by_id_mut(server_id) {
            app.kill();
        }
        self.handle_state_changed(server_id, SessionServerState::NotRunning);
    }

    /// Peer EOF on the RPC channel (`PeerDisconnect`, §3/§7): unconditional
    /// teardown, but the subsequent relaunch is gated on `expected_state`
    /// exactly like a healthcheck-triggered restart.
    fn handle_disconnect(&self, server_id: ServerId) {
        let captured = self.registry.lock().by_id(server_id).map(|app| {
            (
                app.app_name().to_string(),
                app.expected_state(),
                app.app_config().clone(),
            )
        });
        let Some((app_name, expected_state, config)) = captured else {
            return;
        };
        log::warn!("session server {server_id} ('{app_name}') disconnected unexpectedly");
        if let Some(app) = self.registry.lock().by_id_mut(server_id) {
            app.kill();
        }
        self.handle_state_changed(server_id, SessionServerState::NotRunning);
        if !app_name.is_empty() && expected_state.is_restartable() {
            self.handle_initiate_application(app_name, expected_state, config);
        }
    }

    fn handle_ack(&self, server_id: ServerId, ping_id: i32, success: bool) {
        let healthcheck = Arc::clone(&self.healthcheck);
        let sink = self.me();
        healthcheck.on_ack_received(server_id, ping_id, success, sink.as_ref());
    }

    /// §4.5: "For every app in the registry, call
    /// `controller.perform_ping(id, ping_id)`. On success notify healthcheck
    /// `on_ping_sent`; on failure notify `on_ping_failed`."
    fn do_send_ping_events(&self, ping_id: i32) {
        let ids = self.registry.lock().ids();
        for id in ids {
            if self.controller.perform_ping(id, ping_id) {
                self.healthcheck.on_ping_sent(id, ping_id);
            } else {
                let sink = self.me();
                self.healthcheck.on_ping_failed(id, ping_id, sink.as_ref());
            }
        }
    }

    /// §4.5.4: a healthcheck-triggered restart. The *entire* sequence,
    /// including teardown, is gated on `expected_state` — unlike
    /// `handle_disconnect`, which always tears down and only gates the
    /// relaunch.
    fn do_restart_server(&self, server_id: ServerId) {
        let captured = self.registry.lock().by_id(server_id).map(|app| {
            (
                app.app_name().to_string(),
                app.expected_state(),
                app.app_config().clone(),
            )
        });
        let Some((app_name, expected_state, config)) = captured else {
            log::warn!("restart requested for unknown session server {server_id}");
            return;
        };
        if !expected_state.is_restartable() {
            return;
        }
        if let Some(app) = self.registry.lock().by_id_mut(server_id) {
            app.kill();
        }
        self.handle_state_changed(server_id, SessionServerState::NotRunning);
        self.handle_initiate_application(app_name, expected_state, config);
    }

    // ---- public-facing operations, run on the event thread ----------

    /// §4.5.1. Returns `true` per the selection rule: configuring a
    /// preloaded worker always returns `true` once a replacement preload has
    /// been scheduled, regardless of that worker's own configure outcome.
    fn handle_initiate_application(
        &self,
        app_name: String,
        state: SessionServerState,
        config: AppConfig,
    ) -> bool {
        if state == SessionServerState::NotRunning {
            return false;
        }
        if self.registry.lock().id_by_name(&app_name).is_some() {
            return false;
        }

        let preloaded_id = self.registry.lock().first_preloaded_connected(&self.controller);
        match preloaded_id {
            Some(id) => {
                self.configure_preloaded(id, app_name, state, config);
                true
            }
            None => self.spawn_bound(&app_name, state, config),
        }
    }

    /// §4.5.1 "Configuring a preloaded app". Every exit path either sends a
    /// working `SetConfiguration` or runs `fail_preloaded`, and always
    /// schedules a fresh preload so the warm pool stays full.
    fn configure_preloaded(
        &self,
        server_id: ServerId,
        app_name: String,
        state: SessionServerState,
        config: AppConfig,
    ) {
        let configured = self.registry.lock().by_id_mut(server_id).map(|app| {
            app.configure(app_name.clone(), state, config.clone(), &self.config.socket_permissions)
        });
        let configured = match configured {
            Some(Ok(true)) => true,
            _ => false,
        };
        if !configured {
            self.fail_preloaded(server_id);
            self.preload_one();
            return;
        }
        self.registry.lock().bind_name(server_id, &app_name);

        let ok = self.controller.perform_set_configuration(
            server_id,
            state,
            &app_name,
            &config,
            self.config.socket_permissions.clone(),
            self.config.max_resources,
            self.config.initial_log_levels.clone(),
        );
        if !ok {
            self.fail_preloaded(server_id);
        }
        self.preload_one();
    }

    /// A preloaded worker whose `configure()` (or the `SetConfiguration` RPC
    /// that follows it) failed. Since `configure()` clears the `preloaded`
    /// flag on success even if the RPC then fails, the generic
    /// "Error AND preloaded" branch of `handle_state_changed` cannot be
    /// relied on here — the teardown is driven explicitly instead.
    fn fail_preloaded(&self, server_id: ServerId) {
        self.handle_state_changed(server_id, SessionServerState::Error);
        if let Some(app) = self.registry.lock().by_id_mut(server_id) {
            app.kill();
        }
        self.handle_state_changed(server_id, SessionServerState::NotRunning);
    }

    /// §4.5.2.
    fn handle_set_session_server_state(&self, app_name: String, state: SessionServerState) -> bool {
        let Some(server_id) = self.registry.lock().id_by_name(&app_name) else {
            return false;
        };
        if let Some(app) = self.registry.lock().by_id_mut(server_id) {
            app.set_expected_state(state);
        }
        if self.controller.perform_set_state(server_id, state) {
            true
        } else {
            self.handle_state_change_failure(server_id, state);
            false
        }
    }

    /// The `handle_state_change_failure` helper named in §4.5.
    fn handle_state_change_failure(&self, server_id: ServerId, state: SessionServerState) {
        if state == SessionServerState::NotRunning {
            if let Some(app) = self.registry.lock().by_id_mut(server_id) {
                app.kill();
            }
            self.handle_state_changed(server_id, SessionServerState::NotRunning);
        } else {
            self.handle_state_changed(server_id, SessionServerState::Error);
        }
    }

    fn handle_get_app_connection_info(&self, app_name: String) -> String {
        let registry = self.registry.lock();
        match registry.id_by_name(&app_name) {
            Some(id) => registry.by_id(id).map(|app| app.connection_info()).unwrap_or_default(),
            None => String::new(),
        }
    }

    fn handle_set_log_levels(&self, levels: LoggingLevels) -> bool {
        self.controller.set_log_levels(levels)
    }

    /// §4.5.3, the heart of the state machine. Also invoked internally (not
    /// just from the `StateChanged` RPC event) by the startup-timeout,
    /// disconnect, restart, and configure-failure paths, each of which
    /// needs the same observer-notify + transition logic.
    fn handle_state_changed(&self, server_id: ServerId, new_state: SessionServerState) {
        let app_name = match self.registry.lock().by_id(server_id) {
            Some(app) => app.app_name().to_string(),
            None => return,
        };

        self.notify_observer(&app_name, new_state);

        match new_state {
            SessionServerState::Uninitialized => {
                if let Some(app) = self.registry.lock().by_id_mut(server_id) {
                    app.cancel_startup_timer();
                }
                let preloaded = self.registry.lock().by_id(server_id).map(|app| app.is_preloaded());
                if preloaded == Some(false) {
                    let sent = {
                        let registry = self.registry.lock();
                        registry.by_id(server_id).map(|app| {
                            self.controller.perform_set_configuration(
                                server_id,
                                app.initial_state(),
                                app.app_name(),
                                app.app_config(),
                                self.config.socket_permissions.clone(),
                                self.config.max_resources,
                                self.config.initial_log_levels.clone(),
                            )
                        })
                    };
                    if sent == Some(false) {
                        self.handle_state_changed(server_id, SessionServerState::Error);
                        if let Some(app) = self.registry.lock().by_id_mut(server_id) {
                            app.kill();
                        }
                        self.handle_state_changed(server_id, SessionServerState::NotRunning);
                    }
                }
            }
            SessionServerState::Error => {
                let preloaded = self.registry.lock().by_id(server_id).map(|app| app.is_preloaded());
                if preloaded == Some(true) {
                    self.drop_registry_entry(server_id);
                    self.preload_one();
                }
            }
            SessionServerState::NotRunning => {
                self.drop_registry_entry(server_id);
            }
            SessionServerState::Inactive | SessionServerState::Active => {}
        }
    }

    fn notify_observer(&self, app_name: &str, state: SessionServerState) {
        if app_name.is_empty() {
            return;
        }
        if let Some(observer) = self.observer.lock().clone() {
            observer.on_state_changed(app_name, state);
        }
    }

    /// Removes the client, notifies healthcheck, and drops the registry
    /// entry. Idempotent: a second call against an already-removed id is a
    /// no-op, matching §8's `NotRunning` applied-twice law.
    fn drop_registry_entry(&self, server_id: ServerId) {
        self.controller.remove_client(server_id);
        self.healthcheck.on_server_removed(server_id);
        self.registry.lock().remove(server_id);
    }

    fn shutdown_all_session_servers(&self) {
        self.healthcheck.stop();
        let ids = self.registry.lock().ids();
        for id in ids {
            self.controller.remove_client(id);
            if let Some(app) = self.registry.lock().by_id_mut(id) {
                app.kill();
            }
            self.registry.lock().remove(id);
        }
    }
}

impl ClientEventSink for Inner {
    fn on_state_changed(&self, server_id: ServerId, new_state: SessionServerState) {
        let inner = self.me();
        self.event_thread
            .post(move || inner.handle_state_changed(server_id, new_state));
    }

    fn on_ack(&self, server_id: ServerId, ping_id: i32, success: bool) {
        let inner = self.me();
        self.event_thread
            .post(move || inner.handle_ack(server_id, ping_id, success));
    }
}

impl HealthcheckSupervisor for Inner {
    fn emit_state(&self, server_id: ServerId, state: SessionServerState) {
        let inner = self.me();
        self.event_thread
            .post(move || inner.handle_state_changed(server_id, state));
    }

    fn send_ping_events(&self, ping_id: i32) {
        let inner = self.me();
        self.event_thread
            .post(move || inner.do_send_ping_events(ping_id));
    }

    fn restart_server(&self, server_id: ServerId) {
        let inner = self.me();
        self.event_thread
            .post(move || inner.do_restart_server(server_id));
    }
}

/// The public handle: spawns the event thread and the healthcheck timer at
/// construction, and posts every operation onto that thread.
pub struct SessionServerAppManager {
    inner: Arc<Inner>,
}

impl SessionServerAppManager {
    pub fn new(os: Arc<dyn Os>, config: ManagerConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            self_weak: Mutex::new(weak.clone()),
            os,
            timers: TimerService::new(),
            event_thread: EventThread::spawn(),
            controller: Controller::new(),
            healthcheck: HealthcheckService::new(config.failures_before_recovery),
            registry: Mutex::new(Registry::default()),
            observer: Mutex::new(None),
            config,
        });

        let healthcheck = Arc::clone(&inner.healthcheck);
        let supervisor: Arc<dyn HealthcheckSupervisor> = inner.clone();
        healthcheck.start(inner.config.healthcheck_interval, &inner.timers, supervisor);

        SessionServerAppManager { inner }
    }

    pub fn set_observer(&self, observer: Arc<dyn StateObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    /// Posts a task that spawns `n` preloaded apps. Individual failures are
    /// logged and do not abort the loop.
    pub fn preload_session_servers(&self, n: u32) {
        let inner = Arc::clone(&self.inner);
        self.inner.event_thread.post(move || {
            for _ in 0..n {
                inner.preload_one();
            }
        });
    }

    pub fn initiate_application(
        &self,
        app_name: impl Into<String>,
        state: SessionServerState,
        config: AppConfig,
    ) -> bool {
        let app_name = app_name.into();
        let inner = Arc::clone(&self.inner);
        self.inner
            .event_thread
            .post_blocking(move || inner.handle_initiate_application(app_name, state, config))
            .unwrap_or(false)
    }

    pub fn set_session_server_state(&self, app_name: impl Into<String>, state: SessionServerState) -> bool {
        let app_name = app_name.into();
        let inner = Arc::clone(&self.inner);
        self.inner
            .event_thread
            .post_blocking(move || inner.handle_set_session_server_state(app_name, state))
            .unwrap_or(false)
    }

    pub fn get_app_connection_info(&self, app_name: impl Into<String>) -> String {
        let app_name = app_name.into();
        let inner = Arc::clone(&self.inner);
        self.inner
            .event_thread
            .post_blocking(move || inner.handle_get_app_connection_info(app_name))
            .unwrap_or_default()
    }

    pub fn set_log_levels(&self, levels: LoggingLevels) -> bool {
        let inner = Arc::clone(&self.inner);
        self.inner
            .event_thread
            .post_blocking(move || inner.handle_set_log_levels(levels))
            .unwrap_or(false)
    }

    /// Kills every tracked child, flushes the event queue, then tears down
    /// the event thread. No further public operation observably mutates
    /// state afterwards (§8 invariant 5).
    pub fn shutdown(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .event_thread
            .post(move || inner.shutdown_all_session_servers());
        self.inner.event_thread.flush();
        self.inner.event_thread.shutdown();
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use ssm_core::FakeOs;
    use ssm_protocol::SocketLocation;
    use std::time::Duration;

    fn preloaded_app() -> SessionServerApp {
        let os: Arc<dyn Os> = Arc::new(FakeOs::new());
        SessionServerApp::launch_preloaded(
            ServerId::next(),
            os,
            &TimerService::new(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            || {},
        )
        .unwrap()
    }

    /// The exact sequence `configure_preloaded` drives: `insert` an app with
    /// an empty name (as the preload pool does), `configure()` it, then
    /// `bind_name` it — `id_by_name` must find it afterwards, and the
    /// duplicate-name guard `handle_initiate_application` relies on must be
    /// able to see it too.
    #[test]
    fn bind_name_makes_a_warm_started_app_reachable_by_name() {
        let app = preloaded_app();
        let id = app.server_id();
        let mut registry = Registry::default();
        registry.insert(app); // inserted while the in-memory app_name was still empty

        registry
            .by_id_mut(id)
            .unwrap()
            .configure(
                "App",
                SessionServerState::Active,
                AppConfig::new("disp").with_socket(SocketLocation::Path(String::new())),
                &SocketPermissions::default(),
            )
            .unwrap();
        assert_eq!(registry.id_by_name("App"), None);

        registry.bind_name(id, "App");
        assert_eq!(registry.id_by_name("App"), Some(id));
    }

    #[test]
    fn bind_name_is_a_no_op_for_an_empty_name() {
        let app = preloaded_app();
        let id = app.server_id();
        let mut registry = Registry::default();
        registry.insert(app);

        registry.bind_name(id, "");
        assert_eq!(registry.id_by_name(""), None);
    }

    /// Once bound, `remove` must also clear the secondary index — the same
    /// invariant `insert`'s own name tracking relies on, now exercised
    /// through the `bind_name` path instead.
    #[test]
    fn remove_clears_a_name_bound_after_insert() {
        let app = preloaded_app();
        let id = app.server_id();
        let mut registry = Registry::default();
        registry.insert(app);

        registry
            .by_id_mut(id)
            .unwrap()
            .configure(
                "App",
                SessionServerState::Active,
                AppConfig::new("disp").with_socket(SocketLocation::Path(String::new())),
                &SocketPermissions::default(),
            )
            .unwrap();
        registry.bind_name(id, "App");
        assert!(registry.remove(id).is_some());
        assert_eq!(registry.id_by_name("App"), None);
    }
}
