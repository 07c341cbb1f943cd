use std::time::Duration;

use ssm_protocol::{LoggingLevels, MaxResourceCapabilities, SocketPermissions};

use crate::raw::RawConfig;

/// The merged, typed result of folding up to three layered JSON config
/// files: base, SoC-specific, and overrides. Consumed directly by
/// `ssm-manager::ManagerConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerManagerConfig {
    pub environment: Vec<(String, String)>,
    pub session_server_path: String,
    pub startup_timeout: Duration,
    pub healthcheck_interval: Duration,
    pub socket_permissions: SocketPermissions,
    pub num_of_preloaded_servers: u32,
    pub failures_before_recovery: u32,
    pub initial_log_levels: LoggingLevels,
    pub max_resources: MaxResourceCapabilities,
}

impl Default for ServerManagerConfig {
    fn default() -> Self {
        ServerManagerConfig {
            environment: Vec::new(),
            session_server_path: String::new(),
            startup_timeout: Duration::from_millis(5000),
            healthcheck_interval: Duration::from_secs(0),
            socket_permissions: SocketPermissions::default(),
            num_of_preloaded_servers: 0,
            failures_before_recovery: 3,
            initial_log_levels: LoggingLevels::default(),
            max_resources: MaxResourceCapabilities::default(),
        }
    }
}

/// Splits a `"K=V"` string into a `(name, value)` pair. Entries with no
/// `=`, or an empty name, are silently dropped — they cannot name an
/// environment variable.
fn parse_env_entry(entry: &str) -> Option<(String, String)> {
    let (name, value) = entry.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

fn parse_env_list(entries: &[String]) -> Vec<(String, String)> {
    entries.iter().filter_map(|e| parse_env_entry(e)).collect()
}

impl ServerManagerConfig {
    /// Folds `layers` (in order: base, SoC-specific, overrides) into a
    /// single config. Every key overwrites the previous layer's value
    /// except `extra_env_variables`, which is concatenated across every
    /// layer that sets it, base first.
    pub(crate) fn fold(layers: &[RawConfig]) -> Self {
        let mut config = ServerManagerConfig::default();
        let mut extra_env: Vec<String> = Vec::new();

        for layer in layers {
            if let Some(vars) = &layer.environment_variables {
                config.environment = parse_env_list(vars);
            }
            if let Some(vars) = &layer.extra_env_variables {
                extra_env.extend(vars.iter().cloned());
            }
            if let Some(path) = &layer.session_server_path {
                config.session_server_path = path.clone();
            }
            if let Some(ms) = layer.startup_timeout_ms {
                config.startup_timeout = Duration::from_millis(ms);
            }
            if let Some(secs) = layer.healthcheck_interval_in_seconds {
                config.healthcheck_interval = Duration::from_secs(secs);
            }
            if let Some(digits) = layer.socket_permissions {
                let owner_user = config.socket_permissions.owner_user.take();
                let owner_group = config.socket_permissions.owner_group.take();
                config.socket_permissions = SocketPermissions::from_decimal_digits(digits);
                config.socket_permissions.owner_user = owner_user;
                config.socket_permissions.owner_group = owner_group;
            }
            if let Some(owner) = &layer.socket_owner {
                config.socket_permissions.owner_user =
                    if owner.is_empty() { None } else { Some(owner.clone()) };
            }
            if let Some(group) = &layer.socket_group {
                config.socket_permissions.owner_group =
                    if group.is_empty() { None } else { Some(group.clone()) };
            }
            if let Some(n) = layer.num_of_preloaded_servers {
                config.num_of_preloaded_servers = n;
            }
            if let Some(n) = layer.num_of_pings_before_recovery {
                config.failures_before_recovery = n;
            }
            if let Some(mask) = layer.log_level {
                config.initial_log_levels = LoggingLevels::from_bitmask(mask);
            }
        }

        config.environment.extend(parse_env_list(&extra_env));
        config
    }
}
