use serde::Deserialize;

/// One layer of the on-disk JSON configuration, exactly as read off disk.
/// Every field is optional: a missing key leaves whatever the prior layer
/// (or the built-in default) already had in place.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawConfig {
    pub(crate) environment_variables: Option<Vec<String>>,
    pub(crate) extra_env_variables: Option<Vec<String>>,
    pub(crate) session_server_path: Option<String>,
    pub(crate) startup_timeout_ms: Option<u64>,
    pub(crate) healthcheck_interval_in_seconds: Option<u64>,
    pub(crate) socket_permissions: Option<u32>,
    pub(crate) socket_owner: Option<String>,
    pub(crate) socket_group: Option<String>,
    pub(crate) num_of_preloaded_servers: Option<u32>,
    pub(crate) num_of_pings_before_recovery: Option<u32>,
    pub(crate) log_level: Option<u32>,
}
