//! The healthcheck (ping) engine (C8): one periodic timer drives a ping
//! round across every tracked server, with a failure-counting policy that
//! escalates to a restart request after `failures_before_recovery`
//! consecutive misses.
//!
//! Exactly one round is outstanding at a time, identified by
//! `current_ping_id`; a reply or failure tagged with any other id is a
//! stale straggler from a round boundary and is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use ssm_core::{TimerHandle, TimerService};
use ssm_protocol::{ServerId, SessionServerState};

/// Callback surface the supervisor implements so the healthcheck engine can
/// drive state transitions and restarts without holding a lock across the
/// call — the supervisor never holds the healthcheck's mutex while calling
/// back into it, and vice versa.
pub trait HealthcheckSupervisor: Send + Sync {
    fn emit_state(&self, server_id: ServerId, state: SessionServerState);
    fn send_ping_events(&self, ping_id: i32);
    fn restart_server(&self, server_id: ServerId);
}

struct HealthcheckState {
    current_ping_id: i32,
    remaining_acks: HashSet<ServerId>,
    consecutive_failures: HashMap<ServerId, u32>,
}

pub struct HealthcheckService {
    failures_before_recovery: u32,
    state: Mutex<HealthcheckState>,
    timer: Mutex<Option<TimerHandle>>,
}

impl HealthcheckService {
    pub fn new(failures_before_recovery: u32) -> Arc<Self> {
        Arc::new(HealthcheckService {
            failures_before_recovery,
            state: Mutex::new(HealthcheckState {
                current_ping_id: -1,
                remaining_acks: HashSet::new(),
                consecutive_failures: HashMap::new(),
            }),
            timer: Mutex::new(None),
        })
    }

    /// Arms the periodic ping timer against `supervisor`. A zero interval
    /// leaves no timer armed at all, matching the boundary behaviour that a
    /// disabled healthcheck never creates a ping timer.
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        timers: &TimerService,
        supervisor: Arc<dyn HealthcheckSupervisor>,
    ) {
        if interval.is_zero() {
            return;
        }
        let service = Arc::clone(self);
        let handle = timers.every(interval, move || {
            service.on_timer_fire(supervisor.as_ref());
        });
        *self.timer.lock() = Some(handle);
    }

    /// Disarms the ping timer, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.cancel();
        }
    }

    /// Every `server_id` still outstanding from the previous round is
    /// treated as a timeout and run through the same escalation path as an
    /// explicit failed ack, so that a timeout on the round that crosses the
    /// failure threshold restarts the server exactly like any other
    /// failure would.
    pub fn on_timer_fire(&self, supervisor: &dyn HealthcheckSupervisor) {
        let timed_out: Vec<ServerId> = self.state.lock().remaining_acks.drain().collect();
        for server_id in timed_out {
            self.handle_error(server_id, supervisor);
        }
        let ping_id = {
            let mut state = self.state.lock();
            state.current_ping_id = state.current_ping_id.wrapping_add(1);
            state.current_ping_id
        };
        supervisor.send_ping_events(ping_id);
    }

    pub fn on_ping_sent(&self, server_id: ServerId, ping_id: i32) {
        let mut state = self.state.lock();
        if ping_id != state.current_ping_id {
            return;
        }
        state.remaining_acks.insert(server_id);
        state.consecutive_failures.entry(server_id).or_insert(0);
    }

    /// A `perform_ping` call that didn't even round-trip at the RPC layer.
    /// A server already being tracked is a recurring failure and goes
    /// through the shared escalation path; a server with no failure entry
    /// yet is a fresh one, recorded without checking the threshold (a
    /// single RPC-layer failure should never by itself trigger a restart).
    pub fn on_ping_failed(&self, server_id: ServerId, ping_id: i32, supervisor: &dyn HealthcheckSupervisor) {
        if ping_id != self.state.lock().current_ping_id {
            return;
        }
        let already_tracked = self.state.lock().consecutive_failures.contains_key(&server_id);
        if already_tracked {
            self.handle_error(server_id, supervisor);
        } else {
            supervisor.emit_state(server_id, SessionServerState::Error);
            self.state.lock().consecutive_failures.insert(server_id, 1);
        }
    }

    pub fn on_ack_received(
        &self,
        server_id: ServerId,
        ping_id: i32,
        success: bool,
        supervisor: &dyn HealthcheckSupervisor,
    ) {
        {
            let mut state = self.state.lock();
            if ping_id != state.current_ping_id {
                return;
            }
            state.remaining_acks.remove(&server_id);
        }
        if success {
            self.state.lock().consecutive_failures.insert(server_id, 0);
        } else {
            self.handle_error(server_id, supervisor);
        }
    }

    pub fn on_server_removed(&self, server_id: ServerId) {
        let mut state = self.state.lock();
        state.remaining_acks.remove(&server_id);
        state.consecutive_failures.remove(&server_id);
    }

    fn handle_error(&self, server_id: ServerId, supervisor: &dyn HealthcheckSupervisor) {
        supervisor.emit_state(server_id, SessionServerState::Error);
        let should_restart = {
            let mut state = self.state.lock();
            let failures = state.consecutive_failures.entry(server_id).or_insert(0);
            *failures += 1;
            if *failures >= self.failures_before_recovery {
                *failures = 0;
                true
            } else {
                false
            }
        };
        if should_restart {
            supervisor.restart_server(server_id);
        }
    }

    #[cfg(test)]
    fn failure_count(&self, server_id: ServerId) -> u32 {
        self.state
            .lock()
            .consecutive_failures
            .get(&server_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSupervisor {
        events: Mutex<Vec<(ServerId, SessionServerState)>>,
        pings: Mutex<Vec<i32>>,
        restarts: Mutex<Vec<ServerId>>,
    }

    impl HealthcheckSupervisor for RecordingSupervisor {
        fn emit_state(&self, server_id: ServerId, state: SessionServerState) {
            self.events.lock().push((server_id, state));
        }

        fn send_ping_events(&self, ping_id: i32) {
            self.pings.lock().push(ping_id);
        }

        fn restart_server(&self, server_id: ServerId) {
            self.restarts.lock().push(server_id);
        }
    }

    #[test]
    fn failures_before_recovery_of_one_restarts_on_first_failure() {
        let service = HealthcheckService::new(1);
        let supervisor = RecordingSupervisor::default();
        let id = ServerId::next();

        service.on_ping_sent(id, -1);
        service.on_ack_received(id, -1, false, &supervisor);

        assert_eq!(supervisor.events.lock().as_slice(), &[(id, SessionServerState::Error)]);
        assert_eq!(supervisor.restarts.lock().as_slice(), &[id]);
        assert_eq!(service.failure_count(id), 0);
    }

    #[test]
    fn two_consecutive_timeouts_restart_when_threshold_is_two() {
        let service = HealthcheckService::new(2);
        let supervisor = RecordingSupervisor::default();
        let id = ServerId::next();

        // Round 0: sent, never acked.
        service.on_ping_sent(id, -1);
        // Timer fire starts round 1: round 0 times out (failure #1).
        service.on_timer_fire(&supervisor);
        assert_eq!(supervisor.pings.lock().as_slice(), &[0]);
        assert!(supervisor.restarts.lock().is_empty());

        service.on_ping_sent(id, 0);
        // Timer fire starts round 2: round 1 times out (failure #2) -> restart.
        service.on_timer_fire(&supervisor);

        assert_eq!(supervisor.restarts.lock().as_slice(), &[id]);
        assert_eq!(
            supervisor.events.lock().as_slice(),
            &[(id, SessionServerState::Error), (id, SessionServerState::Error)]
        );
    }

    #[test]
    fn successful_ack_resets_the_failure_count() {
        let service = HealthcheckService::new(2);
        let supervisor = RecordingSupervisor::default();
        let id = ServerId::next();

        service.on_ping_sent(id, -1);
        service.on_ack_received(id, -1, false, &supervisor);
        assert_eq!(service.failure_count(id), 1);

        service.on_ping_sent(id, -1);
        service.on_ack_received(id, -1, true, &supervisor);
        assert_eq!(service.failure_count(id), 0);
        assert!(supervisor.restarts.lock().is_empty());
    }

    #[test]
    fn stale_ping_id_is_ignored() {
        let service = HealthcheckService::new(1);
        let supervisor = RecordingSupervisor::default();
        let id = ServerId::next();

        service.on_ping_sent(id, -1);
        // current_ping_id is -1; an ack for round 7 is stale and ignored.
        service.on_ack_received(id, 7, false, &supervisor);
        assert!(supervisor.events.lock().is_empty());
    }

    #[test]
    fn on_server_removed_forgets_both_maps() {
        let service = HealthcheckService::new(1);
        let id = ServerId::next();
        service.on_ping_sent(id, -1);
        service.on_server_removed(id);
        assert_eq!(service.failure_count(id), 0);
        assert!(service.state.lock().remaining_acks.is_empty());
    }

    #[test]
    fn zero_interval_never_arms_a_timer() {
        let service = HealthcheckService::new(3);
        let supervisor: Arc<dyn HealthcheckSupervisor> = Arc::new(RecordingSupervisor::default());
        service.start(Duration::from_secs(0), &TimerService::new(), supervisor);
        assert!(service.timer.lock().is_none());
    }
}
