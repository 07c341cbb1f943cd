//! `SessionServerApp` (C7): one child process, its management socket pair,
//! its optional named session-management socket, and its startup timer.
//! Instances live exclusively inside the event thread's registry
//! (`manager::ManagerState`); nothing here is internally synchronized.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ssm_core::{Os, Pid, Signal, TimerHandle, TimerService};
use ssm_protocol::{AppConfig, ServerId, SessionServerState, SocketLocation, SocketPermissions};
use ssm_rpc::NamedSocket;

use crate::error::Result;

static SOCKET_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

fn resolve_socket_path(path: &str) -> PathBuf {
    if path.is_empty() {
        let n = SOCKET_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
        PathBuf::from(format!("/tmp/rialto-{n}"))
    } else if !path.contains('/') {
        PathBuf::from(format!("/tmp/{path}"))
    } else {
        PathBuf::from(path)
    }
}

/// `SSM_SESSION_SERVER_PATH`/`SSM_SESSION_SERVER_STARTUP_TIMEOUT_MS`, read
/// once per spawn, take precedence over the configured path/timeout.
fn overridden_server_path(configured: &str) -> String {
    std::env::var("SSM_SESSION_SERVER_PATH").unwrap_or_else(|_| configured.to_string())
}

fn overridden_startup_timeout(configured: Duration) -> Duration {
    std::env::var("SSM_SESSION_SERVER_STARTUP_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(configured)
}

pub struct SessionServerApp {
    server_id: ServerId,
    app_name: String,
    initial_state: SessionServerState,
    expected_state: SessionServerState,
    app_config: AppConfig,
    os: Arc<dyn Os>,
    pid: Option<Pid>,
    parent_fd: Option<RawFd>,
    named_socket: Option<NamedSocket>,
    startup_timer: Option<TimerHandle>,
    preloaded: bool,
    connected: bool,
    killed: bool,
}

impl SessionServerApp {
    /// Spawns a preloaded (unbound) child with an empty `AppName`.
    #[allow(clippy::too_many_arguments)]
    pub fn launch_preloaded<F>(
        server_id: ServerId,
        os: Arc<dyn Os>,
        timers: &TimerService,
        server_path: &str,
        env: &[(String, String)],
        startup_timeout: Duration,
        on_startup_timeout: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(
            server_id,
            os,
            timers,
            server_path,
            env,
            startup_timeout,
            true,
            on_startup_timeout,
        )
    }

    /// Spawns a bound child, applying `configure`'s effects (naming,
    /// named-socket bind) at construction time instead of later.
    #[allow(clippy::too_many_arguments)]
    pub fn launch_bound<F>(
        server_id: ServerId,
        os: Arc<dyn Os>,
        timers: &TimerService,
        server_path: &str,
        env: &[(String, String)],
        startup_timeout: Duration,
        app_name: impl Into<String>,
        initial_state: SessionServerState,
        config: AppConfig,
        permissions: &SocketPermissions,
        on_startup_timeout: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut app = Self::spawn(
            server_id,
            os,
            timers,
            server_path,
            env,
            startup_timeout,
            false,
            on_startup_timeout,
        )?;
        app.bind_named_socket(&config, permissions)?;
        app.app_name = app_name.into();
        app.initial_state = initial_state;
        app.expected_state = initial_state;
        app.app_config = config;
        Ok(app)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn<F>(
        server_id: ServerId,
        os: Arc<dyn Os>,
        timers: &TimerService,
        server_path: &str,
        env: &[(String, String)],
        startup_timeout: Duration,
        preloaded: bool,
        on_startup_timeout: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let server_path = overridden_server_path(server_path);
        let startup_timeout = overridden_startup_timeout(startup_timeout);

        let pair = os.socket_pair()?;
        let argv = vec![server_path.clone()];
        let spawn_result = os.spawn_child(pair.child_fd, &server_path, &argv, env);
        // The child has either inherited `child_fd` across exec or never
        // will; either way the parent's reference to it is done.
        let _ = os.close(pair.child_fd);
        let pid = match spawn_result {
            Ok(pid) => pid,
            Err(err) => {
                let _ = os.close(pair.parent_fd);
                return Err(err.into());
            }
        };

        let startup_timer = if startup_timeout.is_zero() {
            None
        } else {
            Some(timers.after(startup_timeout, on_startup_timeout))
        };

        Ok(SessionServerApp {
            server_id,
            app_name: String::new(),
            initial_state: SessionServerState::Uninitialized,
            expected_state: SessionServerState::Uninitialized,
            app_config: AppConfig::new(""),
            os,
            pid: Some(pid),
            parent_fd: Some(pair.parent_fd),
            named_socket: None,
            startup_timer,
            preloaded,
            connected: false,
            killed: false,
        })
    }

    /// Binds a preloaded, connected child to a name/config. Allowed exactly
    /// once; returns `false` (not an error) on a non-preloaded instance.
    pub fn configure(
        &mut self,
        app_name: impl Into<String>,
        initial_state: SessionServerState,
        config: AppConfig,
        permissions: &SocketPermissions,
    ) -> Result<bool> {
        if !self.preloaded {
            return Ok(false);
        }
        self.bind_named_socket(&config, permissions)?;
        self.app_name = app_name.into();
        self.initial_state = initial_state;
        self.expected_state = initial_state;
        self.app_config = config;
        self.preloaded = false;
        Ok(true)
    }

    fn bind_named_socket(&mut self, config: &AppConfig, permissions: &SocketPermissions) -> Result<()> {
        if let Some(SocketLocation::Path(path)) = &config.session_management_socket {
            let resolved = resolve_socket_path(path);
            let socket = NamedSocket::bind(resolved, permissions, self.os.as_ref())?;
            self.named_socket = Some(socket);
        }
        Ok(())
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn is_preloaded(&self) -> bool {
        self.preloaded
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn initial_state(&self) -> SessionServerState {
        self.initial_state
    }

    pub fn expected_state(&self) -> SessionServerState {
        self.expected_state
    }

    pub fn set_expected_state(&mut self, state: SessionServerState) {
        self.expected_state = state;
    }

    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    pub fn parent_fd(&self) -> Option<RawFd> {
        self.parent_fd
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// The session-management endpoint a controller would connect to,
    /// matching `get_app_connection_info`: the bound socket's path, the
    /// handed-over fd (as `fd:<n>`) if that's how this app was configured,
    /// or empty if neither applies.
    pub fn connection_info(&self) -> String {
        if let Some(socket) = &self.named_socket {
            return socket.path().display().to_string();
        }
        match &self.app_config.session_management_socket {
            Some(SocketLocation::Fd(fd)) => format!("fd:{fd}"),
            _ => String::new(),
        }
    }

    /// Stops new connections on the named socket and hands its fd to the
    /// caller. After this call this app can no longer serve RPCs over it.
    pub fn release_named_socket(&mut self) -> Option<RawFd> {
        let socket = self.named_socket.take()?;
        socket.block_new_connections();
        Some(socket.release())
    }

    /// Disarms the startup timer. Invoked when the child first reports
    /// `Uninitialized`, or at destruction. A disarmed timer is never
    /// re-armed.
    pub fn cancel_startup_timer(&mut self) {
        if let Some(timer) = self.startup_timer.take() {
            timer.cancel();
        }
    }

    /// `SIGKILL`s the child if still tracked. Idempotent; once called, no
    /// further RPCs should be attempted on this instance.
    pub fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;
        if let Some(pid) = self.pid {
            if pid > 0 {
                let _ = self.os.kill(pid, Signal::SIGKILL);
            }
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }
}

impl Drop for SessionServerApp {
    fn drop(&mut self) {
        self.cancel_startup_timer();
        self.kill();
        if let Some(pid) = self.pid.take() {
            let _ = self.os.waitpid(pid);
        }
        if let Some(fd) = self.parent_fd.take() {
            let _ = self.os.close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssm_core::FakeOs;

    fn timers() -> TimerService {
        TimerService::new()
    }

    #[test]
    fn launch_preloaded_starts_uninitialized_and_unbound() {
        let os: Arc<dyn Os> = Arc::new(FakeOs::new());
        let app = SessionServerApp::launch_preloaded(
            ServerId::next(),
            os,
            &timers(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            || {},
        )
        .unwrap();
        assert!(app.is_preloaded());
        assert!(app.app_name().is_empty());
        assert_eq!(app.initial_state(), SessionServerState::Uninitialized);
    }

    #[test]
    fn configure_binds_once_and_rejects_a_second_call() {
        let fake = Arc::new(FakeOs::new());
        let os: Arc<dyn Os> = fake.clone();
        let mut app = SessionServerApp::launch_preloaded(
            ServerId::next(),
            os,
            &timers(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            || {},
        )
        .unwrap();

        let config = AppConfig::new("My App")
            .with_socket(SocketLocation::Path("myapp".to_string()));
        let ok = app
            .configure(
                "MyApp",
                SessionServerState::Active,
                config.clone(),
                &SocketPermissions::default(),
            )
            .unwrap();
        assert!(ok);
        assert_eq!(app.app_name(), "MyApp");
        assert!(!app.is_preloaded());
        assert_eq!(app.connection_info(), "/tmp/myapp");

        let second = app
            .configure("Other", SessionServerState::Active, config, &SocketPermissions::default())
            .unwrap();
        assert!(!second);
    }

    #[test]
    fn launch_bound_spawns_and_binds_in_one_step() {
        let os: Arc<dyn Os> = Arc::new(FakeOs::new());
        let config = AppConfig::new("disp").with_socket(SocketLocation::Path(String::new()));
        let app = SessionServerApp::launch_bound(
            ServerId::next(),
            os,
            &timers(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            "YouTube",
            SessionServerState::Active,
            config,
            &SocketPermissions::default(),
            || {},
        )
        .unwrap();
        assert_eq!(app.app_name(), "YouTube");
        assert!(!app.is_preloaded());
        assert!(app.connection_info().starts_with("/tmp/rialto-"));
    }

    #[test]
    fn launch_failure_surfaces_an_error_and_closes_both_fds() {
        let fake = Arc::new(FakeOs::new());
        fake.fail_next_spawn();
        let os: Arc<dyn Os> = fake;
        let result = SessionServerApp::launch_preloaded(
            ServerId::next(),
            os,
            &timers(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            || {},
        );
        assert!(result.is_err());
    }

    #[test]
    fn kill_is_idempotent() {
        let fake = Arc::new(FakeOs::new());
        let os: Arc<dyn Os> = fake.clone();
        let mut app = SessionServerApp::launch_preloaded(
            ServerId::next(),
            os,
            &timers(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            || {},
        )
        .unwrap();
        app.kill();
        app.kill();
        assert_eq!(fake.killed().len(), 1);
    }

    #[test]
    fn zero_startup_timeout_never_arms_a_timer() {
        let os: Arc<dyn Os> = Arc::new(FakeOs::new());
        let mut app = SessionServerApp::launch_preloaded(
            ServerId::next(),
            os,
            &timers(),
            "/bin/session-server",
            &[],
            Duration::from_secs(0),
            || panic!("should never fire"),
        )
        .unwrap();
        // cancel_startup_timer on an already-absent timer is a harmless no-op
        app.cancel_startup_timer();
    }
}
