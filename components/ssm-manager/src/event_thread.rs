//! The single-consumer event thread (C10): owner of all mutable supervisor
//! state. Every external stimulus — a public call, an RPC event, a timer
//! firing — becomes a `Box<dyn FnOnce() + Send>` posted here, turning
//! concurrent external calls into one linear sequence.
//!
//! Deadlock rule: a task running *on* the event thread must never call
//! `flush` or `post_blocking` and wait on itself — all internal chaining is
//! done by posting further tasks instead.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send>;

pub struct EventThread {
    sender: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventThread {
    pub fn spawn() -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let handle = thread::Builder::new()
            .name("ssm-event".into())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })
            .expect("failed to spawn event thread");
        EventThread {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues `task`. Never blocks the caller. A no-op once the thread
    /// has been shut down.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &*self.sender.lock() {
            let _ = sender.send(Box::new(task));
        }
    }

    /// Blocks until every task posted before this call has run.
    pub fn flush(&self) {
        let (tx, rx) = mpsc::channel();
        self.post(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Posts `task` and blocks the caller until it completes, returning its
    /// result, or `None` if the event thread is not accepting tasks
    /// (shutdown already in progress or complete).
    pub fn post_blocking<F, T>(&self, task: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.sender.lock().is_none() {
            return None;
        }
        let (tx, rx) = mpsc::channel();
        self.post(move || {
            let _ = tx.send(task());
        });
        rx.recv().ok()
    }

    /// Stops accepting new tasks and joins the thread once the queue
    /// drains. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_fifo_order() {
        let thread = EventThread::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            thread.post(move || order.lock().push(i));
        }
        thread.flush();
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn post_blocking_returns_the_task_result() {
        let thread = EventThread::spawn();
        let result = thread.post_blocking(|| 2 + 2);
        assert_eq!(result, Some(4));
    }

    #[test]
    fn shutdown_is_idempotent_and_stops_accepting_tasks() {
        let thread = EventThread::spawn();
        thread.shutdown();
        thread.shutdown();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        thread.post(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(thread.post_blocking(|| 1), None);
    }
}
