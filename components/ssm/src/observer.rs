use ssm_manager::StateObserver;
use ssm_protocol::SessionServerState;

/// The default observer: logs every state transition a bound app goes
/// through. A real controller (the application framework this daemon
/// serves) would subscribe its own observer instead; this is what the
/// daemon falls back to when run standalone.
pub struct LoggingObserver;

impl StateObserver for LoggingObserver {
    fn on_state_changed(&self, app_name: &str, state: SessionServerState) {
        match state {
            SessionServerState::Error => log::warn!("'{app_name}' -> {state}"),
            _ => log::info!("'{app_name}' -> {state}"),
        }
    }
}
