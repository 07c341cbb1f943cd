#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Os(#[from] ssm_core::Error),

    #[error(transparent)]
    Rpc(#[from] ssm_rpc::Error),

    #[error("failed to connect an rpc client for a newly spawned session server")]
    ClientConnectFailed,
}

pub type Result<T> = std::result::Result<T, Error>;
