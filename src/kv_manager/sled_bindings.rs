//! Blocking operations on a [sled::Db], run by the kv store task.

use serde::{de::DeserializeOwned, Serialize};
use sled::IVec;

use super::{
    error::{InnerKvError::*, InnerKvResult},
    types::{KeyReservation, RESERVED},
};

fn holds_reservation(value: &IVec) -> bool {
    &value[..] == RESERVED
}

fn decode<V: DeserializeOwned>(key: &str, value: Option<IVec>) -> InnerKvResult<V> {
    match value {
        Some(bytes) if !holds_reservation(&bytes) => Ok(bincode::deserialize(&bytes)?),
        _ => Err(NoValue(key.to_string())),
    }
}

/// Reserve `key` if nothing is stored under it yet.
pub(super) fn handle_reserve(kv: &sled::Db, key: String) -> InnerKvResult<KeyReservation> {
    kv.compare_and_swap(&key, None::<&[u8]>, Some(RESERVED))?
        .map_err(|_| Taken(key.clone()))?;
    Ok(KeyReservation { key })
}

/// Drop a reservation whose value was never put.
pub(super) fn handle_unreserve(kv: &sled::Db, reservation: KeyReservation) -> InnerKvResult<()> {
    kv.compare_and_swap(&reservation.key, Some(RESERVED), None::<&[u8]>)?
        .map_err(|_| NotReserved(reservation.key))
}

/// Store the first value of a reserved key.
pub(super) fn handle_put<V: Serialize>(
    kv: &sled::Db,
    reservation: KeyReservation,
    value: V,
) -> InnerKvResult<()> {
    let bytes = bincode::serialize(&value)?;
    kv.compare_and_swap(&reservation.key, Some(RESERVED), Some(bytes))?
        .map_err(|_| NotReserved(reservation.key))
}

/// Overwrite the value of `key`, creating it if needed. Reserved keys belong
/// to their reservation and cannot be replaced.
pub(super) fn handle_replace<V: Serialize>(kv: &sled::Db, key: String, value: V) -> InnerKvResult<()> {
    if kv.get(&key)?.map_or(false, |v| holds_reservation(&v)) {
        return Err(Reserved(key));
    }
    kv.insert(&key, bincode::serialize(&value)?)?;
    Ok(())
}

pub(super) fn handle_get<V: DeserializeOwned>(kv: &sled::Db, key: String) -> InnerKvResult<V> {
    decode(&key, kv.get(&key)?)
}

/// Reserved keys count as existing.
pub(super) fn handle_exists(kv: &sled::Db, key: &str) -> InnerKvResult<bool> {
    Ok(kv.contains_key(key)?)
}

/// Remove `key` and return its value.
pub(super) fn handle_remove<V: DeserializeOwned>(kv: &sled::Db, key: String) -> InnerKvResult<V> {
    let stored = kv.get(&key)?;
    if stored.as_ref().map_or(false, holds_reservation) {
        return Err(Reserved(key));
    }
    let value = decode(&key, stored)?;
    kv.remove(&key)?;
    Ok(value)
}
