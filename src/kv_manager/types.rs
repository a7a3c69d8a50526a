//! Reservations and the commands served by the kv store task.

use tokio::sync::oneshot;

use super::error::InnerKvResult;

pub const DEFAULT_KV_NAME: &str = "tss";

/// Stores live at `<root>/KV_DIR/<kv_name>`
pub(super) const KV_DIR: &str = "kvstore";

/// Placeholder held by a reserved key until its value is put
pub(super) const RESERVED: &[u8] = &[];

/// The exclusive right to put the first value under a key.
/// Consumed by [super::kv::Kv::put] or [super::kv::Kv::unreserve_key].
#[derive(Debug, PartialEq, Eq)]
pub struct KeyReservation {
    pub(super) key: String,
}

pub(super) type Responder<T> = oneshot::Sender<InnerKvResult<T>>;

pub(super) enum Command<V> {
    Reserve(String, Responder<KeyReservation>),
    Unreserve(KeyReservation),
    Put(KeyReservation, V, Responder<()>),
    Replace(String, V, Responder<()>),
    Get(String, Responder<V>),
    Exists(String, Responder<bool>),
    Remove(String, Responder<V>),
}
