//! Errors of the kv store

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("cannot open kv store: {0}")]
    Open(#[from] sled::Error),
    #[error("kv store task is gone")]
    Closed,
    #[error("kv store dropped the request: {0}")]
    NoAnswer(#[from] tokio::sync::oneshot::error::RecvError),
    #[error("kv {op} failed: {source}")]
    Op {
        op: &'static str,
        source: InnerKvError,
    },
    #[error("unexpected value type: {0}")]
    ValueType(String),
}
pub type KvResult<Success> = Result<Success, KvError>;

/// Failures of the operations run by the kv store task
#[derive(thiserror::Error, Debug)]
pub enum InnerKvError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("key <{0}> is already taken")]
    Taken(String),
    #[error("key <{0}> is not reserved")]
    NotReserved(String),
    #[error("key <{0}> is reserved")]
    Reserved(String),
    #[error("key <{0}> holds no value")]
    NoValue(String),
}
pub(super) type InnerKvResult<Success> = Result<Success, InnerKvError>;
