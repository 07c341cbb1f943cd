//! The supervision core: process lifecycle (C7), the healthcheck/ping
//! engine (C8), the central `SessionServerAppManager` state machine (C9),
//! and the single-consumer event thread (C10) that serializes every
//! external stimulus into one linear sequence.

mod app;
mod error;
mod event_thread;
mod healthcheck;
mod manager;

pub use error::{Error, Result};
pub use healthcheck::HealthcheckSupervisor;
pub use manager::{ManagerConfig, SessionServerAppManager, StateObserver};

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use ssm_core::{FakeOs, Os};
    use ssm_protocol::{AppConfig, SessionServerState, SocketLocation};

    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<(String, SessionServerState)>>,
    }

    impl StateObserver for RecordingObserver {
        fn on_state_changed(&self, app_name: &str, state: SessionServerState) {
            self.events.lock().unwrap().push((app_name.to_string(), state));
        }
    }

    fn manager() -> (Arc<FakeOs>, SessionServerAppManager) {
        let fake = Arc::new(FakeOs::new());
        let os: Arc<dyn Os> = fake.clone();
        let manager = SessionServerAppManager::new(os, ManagerConfig::default());
        (fake, manager)
    }

    fn socket_config(dir: &tempfile::TempDir, name: &str) -> AppConfig {
        let path = dir.path().join(name).display().to_string();
        AppConfig::new("display").with_socket(SocketLocation::Path(path))
    }

    /// A cold start with no preloaded pool spawns a bound app directly and
    /// the RPC connection is live immediately after `initiate_application`
    /// returns.
    #[test]
    fn cold_start_spawns_a_bound_app_and_connects_its_rpc_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, manager) = manager();
        let config = socket_config(&dir, "youtube.sock");
        let ok = manager.initiate_application("YouTube", SessionServerState::Active, config);
        assert!(ok);
        assert_eq!(fake.spawned_commands().len(), 1);
        assert_ne!(manager.get_app_connection_info("YouTube"), "");
        manager.shutdown();
    }

    /// End-to-end scenario 5: concurrent duplicate `initiate_application`
    /// calls for the same name — only one can win the name.
    #[test]
    fn concurrent_duplicate_initiate_only_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (_fake, manager) = manager();
        let manager = Arc::new(manager);
        let config = socket_config(&dir, "a.sock");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let config = config.clone();
                std::thread::spawn(move || manager.initiate_application("A", SessionServerState::Active, config))
            })
            .collect();
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|&&ok| ok).count(), 1);
        manager.shutdown();
    }

    /// Boundary behaviour: `get_app_connection_info` on an unknown app
    /// returns the empty string rather than erroring.
    #[test]
    fn connection_info_for_unknown_app_is_empty() {
        let (_fake, manager) = manager();
        assert_eq!(manager.get_app_connection_info("nope"), "");
        manager.shutdown();
    }

    /// `set_session_server_state` on a name with no registered app returns
    /// `false` without touching anything.
    #[test]
    fn set_state_for_unknown_app_returns_false() {
        let (_fake, manager) = manager();
        assert!(!manager.set_session_server_state("nope", SessionServerState::Active));
        manager.shutdown();
    }

    /// After `shutdown`, every subsequent public operation is a harmless
    /// no-op / default value rather than a panic or hang (Testable
    /// Property / Invariant 5).
    #[test]
    fn no_public_operation_mutates_state_after_shutdown() {
        let (_fake, manager) = manager();
        manager.shutdown();
        let config = AppConfig::new("display").with_socket(SocketLocation::Path(String::new()));
        assert!(!manager.initiate_application("A", SessionServerState::Active, config));
        assert_eq!(manager.get_app_connection_info("A"), "");
    }

    #[test]
    fn observer_sees_error_then_not_running_on_startup_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeOs::new());
        let os: Arc<dyn Os> = fake.clone();
        let mut config = ManagerConfig::default();
        config.startup_timeout = Duration::from_millis(20);
        let manager = SessionServerAppManager::new(os, config);
        let observer = Arc::new(RecordingObserver::default());
        manager.set_observer(observer.clone());

        let app_config = socket_config(&dir, "slow.sock");
        manager.initiate_application("Slow", SessionServerState::Active, app_config);

        std::thread::sleep(Duration::from_millis(200));
        let events = observer.events.lock().unwrap().clone();
        assert!(events.contains(&("Slow".to_string(), SessionServerState::NotRunning)));
        manager.shutdown();
    }
}
