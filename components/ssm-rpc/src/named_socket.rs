//! The named `SOCK_SEQPACKET` session-management socket (C3). Binds a
//! filesystem-path listening socket, applies owner/group/mode, and exposes
//! its fd so it can be handed over to a different app without losing the
//! underlying kernel object.

use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use ssm_core::Os;
use ssm_protocol::SocketPermissions;

use crate::error::{Error, Result};

pub struct NamedSocket {
    path: PathBuf,
    fd: RawFd,
    blocking_new_connections: AtomicBool,
    released: AtomicBool,
}

impl NamedSocket {
    /// Binds a new listening socket at `path`, applying `permissions`
    /// unless they are the "leave as-is" special values.
    pub fn bind(path: impl Into<PathBuf>, permissions: &SocketPermissions, os: &dyn Os) -> Result<Self> {
        let path = path.into();
        // A stale socket file from a previous run would make bind() fail
        // with EADDRINUSE; best effort removal, same as a fresh `chmod`.
        let _ = std::fs::remove_file(&path);

        let sock = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|source| Error::Bind {
            path: path.clone(),
            source,
        })?;

        let addr = UnixAddr::new(&path).map_err(|source| Error::Bind {
            path: path.clone(),
            source,
        })?;
        socket::bind(&sock, &addr).map_err(|source| Error::Bind {
            path: path.clone(),
            source,
        })?;
        let backlog = Backlog::new(16).expect("16 is a valid listen backlog");
        socket::listen(&sock, backlog).map_err(|source| Error::Listen {
            path: path.clone(),
            source,
        })?;

        let fd = sock.into_raw_fd();

        if !permissions.is_unset() {
            os.chmod(&path, permissions.mode())?;
        }
        if permissions.owner_user.is_some() || permissions.owner_group.is_some() {
            os.chown(
                &path,
                permissions.owner_user.as_deref(),
                permissions.owner_group.as_deref(),
            )?;
        }

        Ok(NamedSocket {
            path,
            fd,
            blocking_new_connections: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Stops accepting new connections while keeping the fd alive, so it
    /// can be handed over to another app via `release`. Idempotent.
    pub fn block_new_connections(&self) {
        if self.blocking_new_connections.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = socket::shutdown(self.fd, socket::Shutdown::Read);
    }

    pub fn is_blocking_new_connections(&self) -> bool {
        self.blocking_new_connections.load(Ordering::SeqCst)
    }

    /// Transfers ownership of the underlying fd to the caller. After this
    /// call this handle no longer closes the fd or unlinks the path.
    pub fn release(self) -> RawFd {
        self.released.store(true, Ordering::SeqCst);
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for NamedSocket {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            let _ = nix::unistd::close(self.fd);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssm_core::FakeOs;

    #[test]
    fn bind_creates_socket_file_and_applies_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        let os = FakeOs::new();
        let perms = SocketPermissions::from_decimal_digits(640);

        let socket = NamedSocket::bind(&path, &perms, &os).unwrap();
        assert!(path.exists());
        assert_eq!(socket.path(), path);
        let chmods = os.chmods();
        assert_eq!(chmods, vec![(path.clone(), 0o640)]);
    }

    #[test]
    fn release_does_not_unlink_or_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.sock");
        let os = FakeOs::new();
        let perms = SocketPermissions::default();

        let socket = NamedSocket::bind(&path, &perms, &os).unwrap();
        let fd = socket.release();
        assert!(fd >= 0);
        assert!(path.exists());
        let _ = nix::unistd::close(fd);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn block_new_connections_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.sock");
        let os = FakeOs::new();
        let socket = NamedSocket::bind(&path, &SocketPermissions::default(), &os).unwrap();
        socket.block_new_connections();
        socket.block_new_connections();
        assert!(socket.is_blocking_new_connections());
    }
}
