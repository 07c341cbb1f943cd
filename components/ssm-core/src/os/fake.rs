use std::collections::HashMap;
use std::os::fd::IntoRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};

use super::{ExitStatus, Os, Pid, SocketPair};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChown {
    pub path: PathBuf,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// In-memory stand-in for `Os` used by manager-level tests: never forks,
/// never touches the filesystem. Assigns ever-incrementing fake fds and
/// pids so callers can assert on distinctness without real kernel
/// resources.
#[derive(Default)]
pub struct FakeOs {
    inner: Mutex<FakeOsState>,
}

#[derive(Default)]
struct FakeOsState {
    next_pid: Pid,
    spawned: Vec<(String, Vec<String>)>,
    killed: Vec<(Pid, Signal)>,
    waited: HashMap<Pid, ExitStatus>,
    chmods: Vec<(PathBuf, u32)>,
    chowns: Vec<RecordedChown>,
    fail_spawn: bool,
    child_fds: HashMap<Pid, RawFd>,
}

impl FakeOs {
    pub fn new() -> Self {
        FakeOs {
            inner: Mutex::new(FakeOsState {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    /// Makes the next `spawn_child` call fail, simulating exec failure.
    pub fn fail_next_spawn(&self) {
        self.inner.lock().unwrap().fail_spawn = true;
    }

    /// Arranges for `waitpid(pid)` to report `status` once called.
    pub fn set_exit_status(&self, pid: Pid, status: ExitStatus) {
        self.inner.lock().unwrap().waited.insert(pid, status);
    }

    pub fn spawned_commands(&self) -> Vec<(String, Vec<String>)> {
        self.inner.lock().unwrap().spawned.clone()
    }

    pub fn killed(&self) -> Vec<(Pid, Signal)> {
        self.inner.lock().unwrap().killed.clone()
    }

    pub fn chmods(&self) -> Vec<(PathBuf, u32)> {
        self.inner.lock().unwrap().chmods.clone()
    }

    pub fn chowns(&self) -> Vec<RecordedChown> {
        self.inner.lock().unwrap().chowns.clone()
    }

    /// The fd a test's stand-in "child" can read/write on to simulate the
    /// process that would have inherited `child_fd` across a real
    /// `fork`+`exec`. `None` once no session server has ever been spawned
    /// with this pid.
    pub fn child_fd_for(&self, pid: Pid) -> Option<RawFd> {
        self.inner.lock().unwrap().child_fds.get(&pid).copied()
    }
}

impl Os for FakeOs {
    /// Unlike the rest of this double, this allocates a real kernel
    /// socketpair rather than synthetic fd numbers — tests that exercise
    /// the RPC layer on top of a `FakeOs`-backed app need a pair of fds
    /// that actually support `poll`/`send`/`recv`, even though no real
    /// child process is ever spawned to own the other end.
    fn socket_pair(&self) -> Result<SocketPair> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .map_err(Error::SocketPair)?;
        Ok(SocketPair {
            parent_fd: a.into_raw_fd(),
            child_fd: b.into_raw_fd(),
        })
    }

    /// Mimics the dup-then-close dance a real forked child performs on its
    /// end of the socketpair before the caller closes its own reference to
    /// `child_fd`: duplicates it for a test double to drive directly via
    /// `child_fd_for`, exactly as a real child would have exec'd holding
    /// its own copy.
    fn spawn_child(
        &self,
        child_fd: RawFd,
        path: &str,
        argv: &[String],
        _env: &[(String, String)],
    ) -> Result<Pid> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_spawn {
            state.fail_spawn = false;
            return Err(Error::Spawn(std::io::Error::other("simulated exec failure")));
        }
        let duped = nix::unistd::dup(child_fd)
            .map_err(|e| Error::Spawn(std::io::Error::other(e.to_string())))?;
        state.spawned.push((path.to_string(), argv.to_vec()));
        let pid = state.next_pid;
        state.next_pid += 1;
        state.child_fds.insert(pid, duped);
        Ok(pid)
    }

    fn kill(&self, pid: Pid, signal: Signal) -> Result<()> {
        self.inner.lock().unwrap().killed.push((pid, signal));
        Ok(())
    }

    fn waitpid(&self, pid: Pid) -> Result<ExitStatus> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .waited
            .remove(&pid)
            .unwrap_or(ExitStatus::Exited(0)))
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        let _ = nix::unistd::close(fd);
        Ok(())
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .chmods
            .push((path.to_path_buf(), mode));
        Ok(())
    }

    fn chown(&self, path: &Path, user: Option<&str>, group: Option<&str>) -> Result<()> {
        self.inner.lock().unwrap().chowns.push(RecordedChown {
            path: path.to_path_buf(),
            user: user.map(str::to_string),
            group: group.map(str::to_string),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fds_and_pids_are_distinct_across_calls() {
        let os = FakeOs::new();
        let first = os.socket_pair().unwrap();
        let second = os.socket_pair().unwrap();
        assert_ne!(first.parent_fd, second.parent_fd);
        assert_ne!(first.child_fd, second.child_fd);

        let pid_a = os
            .spawn_child(first.child_fd, "/bin/app", &[], &[])
            .unwrap();
        let pid_b = os
            .spawn_child(second.child_fd, "/bin/app", &[], &[])
            .unwrap();
        assert_ne!(pid_a, pid_b);
    }

    #[test]
    fn fail_next_spawn_is_one_shot() {
        let os = FakeOs::new();
        os.fail_next_spawn();
        assert!(os.spawn_child(0, "/bin/app", &[], &[]).is_err());
        assert!(os.spawn_child(0, "/bin/app", &[], &[]).is_ok());
    }
}
