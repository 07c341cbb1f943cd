use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, ForkResult, Group, Pid as NixPid, User};

use super::{ExitStatus, Os, Pid, SocketPair};
use crate::error::{Error, Result};

/// The production `Os` implementation: real fork/exec/kill/waitpid via
/// `nix`/`libc`. Kept free of manager-level policy so it can be unit
/// tested in isolation from `SessionServerApp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealOs;

impl Os for RealOs {
    fn socket_pair(&self) -> Result<SocketPair> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .map_err(Error::SocketPair)?;
        use std::os::fd::IntoRawFd;
        Ok(SocketPair {
            parent_fd: a.into_raw_fd(),
            child_fd: b.into_raw_fd(),
        })
    }

    fn spawn_child(
        &self,
        child_fd: RawFd,
        path: &str,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<Pid> {
        // All allocation happens before fork(): the child branch below must
        // stick to libc/nix calls that are safe to run with a single thread
        // and a possibly-inconsistent allocator state.
        let path_c = CString::new(path).map_err(Error::from)?;
        let argv_c: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from)?;
        let env_c: Vec<CString> = env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from)?;

        match unsafe { unistd::fork() }.map_err(Error::Fork)? {
            ForkResult::Parent { child } => {
                log::debug!("forked session server pid {} for {path}", child.as_raw());
                Ok(child.as_raw())
            }
            ForkResult::Child => {
                child_exec(child_fd, &path_c, &argv_c, &env_c);
                // child_exec never returns; this is unreachable but keeps
                // the match exhaustive without an `unreachable!()` panic
                // inside a forked child.
                unsafe { libc::_exit(127) }
            }
        }
    }

    fn kill(&self, pid: Pid, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(NixPid::from_raw(pid), signal).map_err(|source| Error::Kill {
            pid,
            signal,
            source,
        })
    }

    fn waitpid(&self, pid: Pid) -> Result<ExitStatus> {
        let status = nix::sys::wait::waitpid(NixPid::from_raw(pid), None)
            .map_err(|source| Error::Wait { pid, source })?;
        Ok(match status {
            WaitStatus::Exited(_, code) => ExitStatus::Exited(code),
            WaitStatus::Signaled(_, sig, _) => ExitStatus::Signaled(sig as i32),
            _ => ExitStatus::Exited(-1),
        })
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        unistd::close(fd).map_err(|e| Error::Close(fd, e))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let mode = Mode::from_bits_truncate(mode);
        fchmodat(None, path, mode, FchmodatFlags::FollowSymlink).map_err(|source| Error::Chmod {
            path: path.to_path_buf(),
            source,
        })
    }

    fn chown(&self, path: &Path, user: Option<&str>, group: Option<&str>) -> Result<()> {
        let owner = match user {
            Some(name) => Some(
                User::from_name(name)
                    .ok()
                    .flatten()
                    .map(|u| u.uid)
                    .ok_or_else(|| Error::UnknownUser(name.to_string()))?,
            ),
            None => None,
        };
        let group = match group {
            Some(name) => Some(
                Group::from_name(name)
                    .ok()
                    .flatten()
                    .map(|g| g.gid)
                    .ok_or_else(|| Error::UnknownGroup(name.to_string()))?,
            ),
            None => None,
        };
        unistd::chown(path, owner, group).map_err(|source| Error::Chown {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn null_fd() -> RawFd {
    nix::fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty()).unwrap_or_else(|_| unsafe {
        libc::_exit(127);
    })
}

/// Runs only inside the forked child, before exec. Any failure here exits
/// immediately rather than unwinding back into the shared, forked Rust
/// runtime state.
fn child_exec(child_fd: RawFd, path: &CString, argv: &[CString], env: &[CString]) -> ! {
    let new_fd = match unistd::dup(child_fd) {
        Ok(fd) => fd,
        Err(_) => unsafe { libc::_exit(127) },
    };
    let _ = unistd::close(child_fd);

    let devnull = null_fd();
    let _ = unistd::dup2(devnull, 0);
    let _ = unistd::dup2(devnull, 1);
    let _ = unistd::dup2(devnull, 2);
    if devnull > 2 {
        let _ = unistd::close(devnull);
    }

    let fd_arg = match CString::new(new_fd.to_string()) {
        Ok(s) => s,
        Err(_) => unsafe { libc::_exit(127) },
    };
    let mut full_argv: Vec<&std::ffi::CStr> = vec![argv.first().map_or(path.as_c_str(), |a| a.as_c_str())];
    full_argv.extend(argv.iter().skip(1).map(|a| a.as_c_str()));
    full_argv.push(fd_arg.as_c_str());
    let env_refs: Vec<&std::ffi::CStr> = env.iter().map(|e| e.as_c_str()).collect();

    let _ = unistd::execve(path, &full_argv, &env_refs);
    unsafe { libc::_exit(127) }
}
