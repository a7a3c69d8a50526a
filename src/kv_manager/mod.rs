//! Persistence on top of [sled]. Every store is served by its own task
//! ([kv::Kv] is the handle); [state] holds what the tss core persists.

pub mod error;
pub mod kv;
mod sled_bindings;
pub mod state;
pub mod types;

pub use state::{AddressBook, KeygenLocalState, KvStateManager, StateManager};
