//! Persistence of keygen results and known peer addresses.

use std::{collections::BTreeMap, convert::TryFrom};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    error::{KvError, KvResult},
    kv::Kv,
    types::DEFAULT_KV_NAME,
};
use crate::{p2p::PeerId, TssResult};

const ADDRESS_BOOK_KEY: &str = "address_book";

/// Everything a node needs from a finished keygen to later sign with the key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenLocalState {
    /// hex-encoded pool public key
    pub pub_key: String,
    /// the engine's local share, opaque to the core
    pub local_data: Vec<u8>,
    pub participant_keys: Vec<String>,
    pub local_party_key: String,
}

/// Known addresses of peers, saved after every successful keygen
pub type AddressBook = BTreeMap<PeerId, Vec<String>>;

#[async_trait]
pub trait StateManager: Send + Sync {
    async fn save_local_state(&self, state: KeygenLocalState) -> TssResult<()>;
    async fn get_local_state(&self, pub_key: &str) -> TssResult<KeygenLocalState>;
    async fn save_address_book(&self, address_book: AddressBook) -> TssResult<()>;
    async fn retrieve_address_book(&self) -> TssResult<AddressBook>;
}

/// Values of the state store; one store holds both kinds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StateValue {
    LocalState(KeygenLocalState),
    AddressBook(AddressBook),
}

impl From<KeygenLocalState> for StateValue {
    fn from(v: KeygenLocalState) -> StateValue {
        StateValue::LocalState(v)
    }
}

impl From<AddressBook> for StateValue {
    fn from(v: AddressBook) -> StateValue {
        StateValue::AddressBook(v)
    }
}

impl TryFrom<StateValue> for KeygenLocalState {
    type Error = KvError;
    fn try_from(v: StateValue) -> Result<Self, Self::Error> {
        match v {
            StateValue::LocalState(state) => Ok(state),
            StateValue::AddressBook(_) => Err(Self::Error::ValueType(
                "Expecting KeygenLocalState, got AddressBook".to_string(),
            )),
        }
    }
}

impl TryFrom<StateValue> for AddressBook {
    type Error = KvError;
    fn try_from(v: StateValue) -> Result<Self, Self::Error> {
        match v {
            StateValue::AddressBook(address_book) => Ok(address_book),
            StateValue::LocalState(_) => Err(Self::Error::ValueType(
                "Expecting AddressBook, got KeygenLocalState".to_string(),
            )),
        }
    }
}

/// [StateManager] on top of a [Kv] store
#[derive(Clone)]
pub struct KvStateManager {
    kv: Kv<StateValue>,
}

impl KvStateManager {
    pub fn new(root: &str) -> KvResult<Self> {
        Ok(Self {
            kv: Kv::new(root, DEFAULT_KV_NAME)?,
        })
    }
}

fn local_state_key(pub_key: &str) -> String {
    format!("localstate-{}", pub_key)
}

#[async_trait]
impl StateManager for KvStateManager {
    async fn save_local_state(&self, state: KeygenLocalState) -> TssResult<()> {
        let reservation = self.kv.reserve_key(local_state_key(&state.pub_key)).await?;
        let pub_key = state.pub_key.clone();
        self.kv.put(reservation, state.into()).await?;
        info!("saved local state of key {}", pub_key);
        Ok(())
    }

    async fn get_local_state(&self, pub_key: &str) -> TssResult<KeygenLocalState> {
        let value = self.kv.get(&local_state_key(pub_key)).await?;
        Ok(KeygenLocalState::try_from(value)?)
    }

    async fn save_address_book(&self, address_book: AddressBook) -> TssResult<()> {
        self.kv
            .replace(ADDRESS_BOOK_KEY, address_book.into())
            .await?;
        Ok(())
    }

    async fn retrieve_address_book(&self) -> TssResult<AddressBook> {
        if !self.kv.exists(ADDRESS_BOOK_KEY).await? {
            return Ok(AddressBook::new());
        }
        let value = self.kv.get(ADDRESS_BOOK_KEY).await?;
        Ok(AddressBook::try_from(value)?)
    }
}
