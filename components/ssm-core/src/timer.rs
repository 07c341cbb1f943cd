//! One-shot and periodic timers. Every fired callback runs on its own
//! timer thread, never on the caller's — callbacks that need to touch
//! manager state are expected to post a task to the event thread rather
//! than mutate anything directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A running (or already-fired) timer. Dropping a handle does not cancel
/// the timer; call `cancel()` explicitly.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevents any future (or in-flight but not yet invoked) firing.
    /// Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `true` for a periodic timer that hasn't been cancelled, or a
    /// one-shot timer that hasn't fired yet.
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && !self.fired.load(Ordering::SeqCst)
    }
}

/// Spawns callbacks after a delay, once or repeatedly. Stateless beyond
/// the threads it starts — safe to share behind a single instance for the
/// whole process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerService;

impl TimerService {
    pub fn new() -> Self {
        TimerService
    }

    /// Runs `callback` once after `delay`, unless cancelled first.
    pub fn after<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let thread_cancelled = Arc::clone(&cancelled);
        let thread_fired = Arc::clone(&fired);

        thread::spawn(move || {
            thread::sleep(delay);
            if thread_cancelled.load(Ordering::SeqCst) {
                return;
            }
            thread_fired.store(true, Ordering::SeqCst);
            callback();
        });

        TimerHandle { cancelled, fired }
    }

    /// Runs `callback` every `period` until cancelled. The first firing
    /// happens after one full `period`, not immediately.
    pub fn every<F>(&self, period: Duration, mut callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        // `fired` is unused for periodic timers beyond satisfying the
        // shared handle type; a periodic timer's liveness is solely its
        // `cancelled` flag.
        let fired = Arc::new(AtomicBool::new(false));
        let thread_cancelled = Arc::clone(&cancelled);

        thread::spawn(move || loop {
            thread::sleep(period);
            if thread_cancelled.load(Ordering::SeqCst) {
                return;
            }
            callback();
        });

        TimerHandle { cancelled, fired }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn one_shot_fires_once() {
        let (tx, rx) = mpsc::channel();
        let timer = TimerService::new();
        let handle = timer.after(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        assert!(handle.is_active());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_active());
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let (tx, rx) = mpsc::channel();
        let timer = TimerService::new();
        let handle = timer.after(Duration::from_millis(50), move || {
            let _ = tx.send(());
        });
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn periodic_fires_multiple_times_until_cancelled() {
        let (tx, rx) = mpsc::channel();
        let timer = TimerService::new();
        let handle = timer.every(Duration::from_millis(10), move || {
            let _ = tx.send(());
        });
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        handle.cancel();
    }
}
