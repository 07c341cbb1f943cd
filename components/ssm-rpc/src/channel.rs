//! The per-child RPC channel (C4): one connected `SOCK_SEQPACKET` socket
//! and one dedicated I/O thread. Carries typed request/response calls and
//! fans out unsolicited events to subscribers.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, MsgFlags};
use serde::{Deserialize, Serialize};

use ssm_protocol::{Event, Request, Response};

use crate::error::{Error, Result};

const POLL_TIMEOUT_MS: u16 = 250;
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_BYTES: usize = 64 * 1024;

pub type SubscriptionId = u64;

#[derive(Serialize, Deserialize)]
enum Frame {
    Call { id: u64, request: Request },
    Reply { id: u64, response: Response },
    Event(Event),
}

struct Shared {
    fd: RawFd,
    pending: Mutex<HashMap<u64, mpsc::SyncSender<Result<Response>>>>,
    subscribers: Mutex<HashMap<SubscriptionId, Box<dyn Fn(Event) + Send>>>,
    next_call_id: AtomicU64,
    next_sub_id: AtomicU64,
    disconnected: AtomicBool,
    io_thread_id: Mutex<Option<thread::ThreadId>>,
}

/// A connected RPC channel. Owns `fd` and the I/O thread that pumps it;
/// both are torn down by `disconnect()`, which is safe to call from any
/// thread, any number of times.
pub struct RpcChannel {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RpcChannel {
    /// Takes ownership of `fd` (already connected) and starts its I/O
    /// thread. `on_disconnected` runs at most once, from the I/O thread,
    /// the moment the peer's end closes unexpectedly.
    pub fn new<D>(fd: RawFd, on_disconnected: D) -> Arc<Self>
    where
        D: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            fd,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            io_thread_id: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ssm-rpc-io".into())
            .spawn(move || {
                *thread_shared.io_thread_id.lock().unwrap() = Some(thread::current().id());
                io_loop(&thread_shared, on_disconnected);
            })
            .expect("failed to spawn rpc I/O thread");

        Arc::new(RpcChannel {
            shared,
            io_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.shared.fd
    }

    /// Blocking request/response call. If invoked from the channel's own
    /// I/O thread (a subscriber handler making a nested call), pumps the
    /// socket directly instead of waiting on a reply that nothing else
    /// would ever service.
    pub fn call(&self, request: Request) -> Result<Response> {
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.send_frame(&Frame::Call { id, request })?;

        let on_io_thread = *self.shared.io_thread_id.lock().unwrap() == Some(thread::current().id());
        if on_io_thread {
            return pump_until_reply(&self.shared, id);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.shared.pending.lock().unwrap().insert(id, tx);
        match rx.recv_timeout(CALL_TIMEOUT) {
            Ok(result) => result,
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// Registers `handler` for every incoming `Event`; dispatch happens on
    /// the channel's I/O thread. Returns a tag usable with `unsubscribe`.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Event) + Send + 'static,
    {
        let id = self.shared.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .insert(id, Box::new(handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.subscribers.lock().unwrap().remove(&id);
    }

    /// Idempotent, thread-safe. Releases any blocking `call()` with
    /// `Error::Disconnected` and stops the I/O thread.
    pub fn disconnect(&self) {
        if self.shared.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = socket::shutdown(self.shared.fd, socket::Shutdown::Both);
        for (_, tx) in self.shared.pending.lock().unwrap().drain() {
            let _ = tx.send(Err(Error::Disconnected));
        }
        if let Some(handle) = self.io_thread.lock().unwrap().take() {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let bytes = bincode::serialize(frame)?;
        socket::send(self.shared.fd, &bytes, MsgFlags::empty()).map_err(Error::Io)?;
        Ok(())
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn pump_until_reply(shared: &Arc<Shared>, call_id: u64) -> Result<Response> {
    loop {
        match recv_one_frame(shared.fd, CALL_TIMEOUT)? {
            Some(Frame::Reply { id, response }) if id == call_id => return Ok(response),
            Some(Frame::Reply { .. }) | Some(Frame::Call { .. }) => continue,
            Some(Frame::Event(event)) => dispatch_event(shared, event),
            None => return Err(Error::Disconnected),
        }
    }
}

fn io_loop<D>(shared: &Arc<Shared>, on_disconnected: D)
where
    D: FnOnce() + Send + 'static,
{
    let mut peer_closed = false;
    while !shared.disconnected.load(Ordering::SeqCst) {
        match recv_one_frame(shared.fd, Duration::from_millis(POLL_TIMEOUT_MS as u64)) {
            Ok(Some(Frame::Reply { id, response })) => {
                if let Some(tx) = shared.pending.lock().unwrap().remove(&id) {
                    let _ = tx.send(Ok(response));
                }
            }
            Ok(Some(Frame::Event(event))) => dispatch_event(shared, event),
            Ok(Some(Frame::Call { .. })) => {
                log::warn!("rpc channel received an unexpected request frame, ignoring");
            }
            Ok(None) => {}
            Err(Error::Disconnected) => {
                peer_closed = true;
                break;
            }
            Err(err) => {
                log::warn!("rpc channel I/O error: {err}");
                peer_closed = true;
                break;
            }
        }
    }

    let already_disconnected = shared.disconnected.swap(true, Ordering::SeqCst);
    for (_, tx) in shared.pending.lock().unwrap().drain() {
        let _ = tx.send(Err(Error::Disconnected));
    }
    if peer_closed && !already_disconnected {
        on_disconnected();
    }
}

fn dispatch_event(shared: &Arc<Shared>, event: Event) {
    let subscribers = shared.subscribers.lock().unwrap();
    for handler in subscribers.values() {
        handler(event);
    }
}

fn recv_one_frame(fd: RawFd, timeout: Duration) -> Result<Option<Frame>> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
    let poll_timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
    let ready = nix::poll::poll(&mut fds, poll_timeout).map_err(Error::Io)?;
    if ready == 0 {
        return Ok(None);
    }
    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if revents.contains(PollFlags::POLLHUP) || revents.contains(PollFlags::POLLERR) {
        return Err(Error::Disconnected);
    }
    if !revents.contains(PollFlags::POLLIN) {
        return Ok(None);
    }

    let mut buf = [0u8; MAX_FRAME_BYTES];
    match socket::recv(fd, &mut buf, MsgFlags::empty()) {
        Ok(0) => Err(Error::Disconnected),
        Ok(n) => Ok(Some(bincode::deserialize(&buf[..n])?)),
        Err(nix::Error::EWOULDBLOCK) => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use ssm_protocol::{PingRequest, PingResponse, SessionServerState, StateChangedEvent};
    use std::os::fd::IntoRawFd;
    use std::sync::mpsc as std_mpsc;

    fn pair() -> (RawFd, RawFd) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        (a.into_raw_fd(), b.into_raw_fd())
    }

    #[test]
    fn call_round_trips_a_ping() {
        let (local, remote) = pair();
        let channel = RpcChannel::new(local, || {});

        // Stand in for the child: read one frame, reply with a matching id.
        let responder = thread::spawn(move || {
            let mut buf = [0u8; MAX_FRAME_BYTES];
            let n = socket::recv(remote, &mut buf, MsgFlags::empty()).unwrap();
            let frame: Frame = bincode::deserialize(&buf[..n]).unwrap();
            if let Frame::Call { id, .. } = frame {
                let reply = Frame::Reply {
                    id,
                    response: Response::Ping(PingResponse),
                };
                let bytes = bincode::serialize(&reply).unwrap();
                socket::send(remote, &bytes, MsgFlags::empty()).unwrap();
            }
            let _ = nix::unistd::close(remote);
        });

        let response = channel.call(Request::Ping(PingRequest { ping_id: 1 })).unwrap();
        assert!(matches!(response, Response::Ping(_)));
        responder.join().unwrap();
        channel.disconnect();
    }

    #[test]
    fn subscribers_receive_events() {
        let (local, remote) = pair();
        let channel = RpcChannel::new(local, || {});
        let (tx, rx) = std_mpsc::channel();
        channel.subscribe(move |event| {
            let _ = tx.send(event);
        });

        let frame = Frame::Event(Event::StateChanged(StateChangedEvent {
            new_state: SessionServerState::Active,
        }));
        let bytes = bincode::serialize(&frame).unwrap();
        socket::send(remote, &bytes, MsgFlags::empty()).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, Event::StateChanged(_)));
        let _ = nix::unistd::close(remote);
        channel.disconnect();
    }

    #[test]
    fn disconnect_is_idempotent_and_releases_pending_calls() {
        let (local, remote) = pair();
        let channel = RpcChannel::new(local, || {});
        channel.disconnect();
        channel.disconnect();
        let result = channel.call(Request::Ping(PingRequest { ping_id: 1 }));
        assert!(matches!(result, Err(Error::Disconnected)));
        let _ = nix::unistd::close(remote);
    }

    #[test]
    fn peer_eof_invokes_on_disconnected_once() {
        let (local, remote) = pair();
        let (tx, rx) = std_mpsc::channel();
        let channel = RpcChannel::new(local, move || {
            let _ = tx.send(());
        });
        let _ = nix::unistd::close(remote);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        channel.disconnect();
    }
}
