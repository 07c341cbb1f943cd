//! Process entry point for the session server manager daemon: parses
//! arguments, loads the layered configuration, wires the supervision core
//! together, preloads the configured warm pool, and blocks handling
//! `SIGTERM`/`SIGINT` for graceful shutdown.

mod cli;
mod observer;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use ssm_core::{Os, RealOs};
use ssm_manager::{ManagerConfig, SessionServerAppManager};

use cli::Cli;
use observer::LoggingObserver;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let base = cli.resolve(&cli.base_config);
    let soc = cli.soc_config.as_ref().map(|p| cli.resolve(p));
    let overrides = cli.override_config.as_ref().map(|p| cli.resolve(p));

    let config = match ssm_config::load(&base, soc.as_deref(), overrides.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "loaded configuration: session_server_path={:?} preloaded={} healthcheck_interval={:?}",
        config.session_server_path,
        config.num_of_preloaded_servers,
        config.healthcheck_interval,
    );

    let manager_config = ManagerConfig {
        session_server_path: config.session_server_path,
        environment: config.environment,
        startup_timeout: config.startup_timeout,
        healthcheck_interval: config.healthcheck_interval,
        failures_before_recovery: config.failures_before_recovery,
        socket_permissions: config.socket_permissions,
        max_resources: config.max_resources,
        initial_log_levels: config.initial_log_levels,
    };

    let os: Arc<dyn Os> = Arc::new(RealOs);
    let manager = SessionServerAppManager::new(os, manager_config);
    manager.set_observer(Arc::new(LoggingObserver));
    manager.preload_session_servers(config.num_of_preloaded_servers);

    let mut signals = match Signals::new([SIGTERM, SIGINT]) {
        Ok(signals) => signals,
        Err(err) => {
            log::error!("failed to install signal handlers: {err}");
            manager.shutdown();
            return ExitCode::FAILURE;
        }
    };

    // Blocks this thread; the supervisor's own event/I/O/timer threads run
    // independently until `shutdown()` tears them down below.
    if let Some(signal) = signals.forever().next() {
        log::info!("received signal {signal}, shutting down");
    }

    manager.shutdown();
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::cli::Cli;
    use clap::Parser;
    use std::path::PathBuf;

    #[test]
    fn resolve_joins_relative_paths_against_config_dir() {
        let cli = Cli::parse_from(["ssm", "--config-dir", "/etc/ssm", "--base-config", "ssm.conf"]);
        assert_eq!(cli.resolve(&PathBuf::from("ssm.conf")), PathBuf::from("/etc/ssm/ssm.conf"));
    }

    #[test]
    fn resolve_leaves_absolute_paths_untouched() {
        let cli = Cli::parse_from(["ssm", "--config-dir", "/etc/ssm"]);
        assert_eq!(
            cli.resolve(&PathBuf::from("/opt/ssm/override.conf")),
            PathBuf::from("/opt/ssm/override.conf")
        );
    }

    #[test]
    fn soc_and_override_configs_default_to_none() {
        let cli = Cli::parse_from(["ssm"]);
        assert!(cli.soc_config.is_none());
        assert!(cli.override_config.is_none());
    }
}
