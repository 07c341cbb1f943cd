use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create named socket at {path:?}: {source}")]
    Bind { path: PathBuf, source: nix::Error },

    #[error("failed to listen on named socket at {path:?}: {source}")]
    Listen { path: PathBuf, source: nix::Error },

    #[error(transparent)]
    Os(#[from] ssm_core::Error),

    #[error("rpc channel is disconnected")]
    Disconnected,

    #[error("rpc call timed out waiting for a reply")]
    Timeout,

    #[error("failed to (de)serialize an rpc frame: {0}")]
    Codec(#[from] bincode::Error),

    #[error("socket I/O error: {0}")]
    Io(#[source] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
