//! The thin port between the manager and the kernel. Everything the
//! manager needs from the operating system — spawning a child bound to a
//! socket fd, signalling it, reaping it, and adjusting the permissions of
//! the named socket it will bind — goes through this trait so that the
//! manager's state machine can be exercised without ever forking a real
//! process.

mod fake;
mod real;

pub use fake::FakeOs;
pub use real::RealOs;

use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::Result;

/// A child's process id, as returned by `spawn_child` and consumed by
/// `kill`/`waitpid`.
pub type Pid = i32;

/// How the session server process exited, as observed by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// A connected, non-blocking, `SOCK_SEQPACKET` pair suitable for the
/// application-management channel.
pub struct SocketPair {
    pub parent_fd: RawFd,
    pub child_fd: RawFd,
}

pub trait Os: Send + Sync {
    /// Creates a new `AF_UNIX`/`SOCK_SEQPACKET` connected pair. `parent_fd`
    /// is retained by the manager for RPC; `child_fd` is handed to the
    /// spawned child and must be closed by the caller once `spawn_child`
    /// returns, win or lose.
    fn socket_pair(&self) -> Result<SocketPair>;

    /// Forks and execs `path` with `argv`/`env`, having the child dup
    /// `child_fd` to a fd without `FD_CLOEXEC` and pass its number as an
    /// argument so the child can recover it after exec. Returns the new
    /// child's pid to the caller; never returns in the forked branch.
    fn spawn_child(
        &self,
        child_fd: RawFd,
        path: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<Pid>;

    /// Sends `signal` to `pid`. Used for both graceful termination
    /// (`SIGTERM`) and the hard kill that follows a grace-period timeout
    /// (`SIGKILL`).
    fn kill(&self, pid: Pid, signal: Signal) -> Result<()>;

    /// Blocks until `pid` exits. Non-blocking reaping is achieved by the
    /// caller only invoking this after a `SIGCHLD`-driven readiness check;
    /// this port exposes only the blocking primitive, matching what a
    /// dedicated reaper thread needs.
    fn waitpid(&self, pid: Pid) -> Result<ExitStatus>;

    fn close(&self, fd: RawFd) -> Result<()>;

    /// Applies `mode` to the named socket path. A no-op is still a valid
    /// implementation detail; callers skip calling this when permissions
    /// are unset.
    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;

    /// Changes the owning user and/or group of the named socket path.
    /// Either may be `None` to leave that half unchanged.
    fn chown(&self, path: &Path, user: Option<&str>, group: Option<&str>) -> Result<()>;
}

pub use nix::sys::signal::Signal;
