use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socketpair() failed: {0}")]
    SocketPair(#[source] nix::Error),

    #[error("fork() failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to spawn child: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("argument contained an interior NUL byte")]
    NulByte(#[from] std::ffi::NulError),

    #[error("kill({pid}, {signal:?}) failed: {source}")]
    Kill {
        pid: i32,
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("waitpid({pid}) failed: {source}")]
    Wait { pid: i32, source: nix::Error },

    #[error("chmod({path:?}) failed: {source}")]
    Chmod { path: PathBuf, source: nix::Error },

    #[error("chown({path:?}) failed: {source}")]
    Chown { path: PathBuf, source: nix::Error },

    #[error("no passwd entry for user {0:?}")]
    UnknownUser(String),

    #[error("no group entry for group {0:?}")]
    UnknownGroup(String),

    #[error("close(fd {0}) failed: {1}")]
    Close(i32, #[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
