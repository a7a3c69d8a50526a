//! Threshold-signature coordination core of a bridge validator node.
//!
//! N mutually-distrusting validators use this crate to assemble a quorum
//! ([join_party]), exchange the messages of an external multi-party
//! computation engine over authenticated peer streams ([p2p], [router]) and,
//! when a round stalls or fails, attribute the fault to specific peers
//! ([blame]). [tss::TssServer] is the entry point used by the chain-level
//! business logic.

pub mod blame;
pub mod config;
pub mod join_party;
pub mod kv_manager;
pub mod p2p;
pub mod router;
pub mod tss;

#[cfg(test)]
mod tests;

// error handling
pub type TssResult<Success> = anyhow::Result<Success>;
