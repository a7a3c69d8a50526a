//! Handle of a kv store. A spawned task owns the [sled::Db]; cloneable [Kv]
//! handles send it commands and await each answer on a oneshot channel.
//! See <https://ryhl.io/blog/actors-with-tokio/>.

use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::{
    error::{KvError, KvResult},
    sled_bindings::{
        handle_exists, handle_get, handle_put, handle_remove, handle_replace, handle_reserve,
        handle_unreserve,
    },
    types::{Command, KeyReservation, Responder, KV_DIR},
};

#[derive(Clone)]
pub struct Kv<V> {
    sender: mpsc::UnboundedSender<Command<V>>,
}

impl<V> Kv<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    /// Open or create the store at `<root>/kvstore/<kv_name>`.
    pub fn new(root: &str, kv_name: &str) -> KvResult<Self> {
        let path = PathBuf::from(root).join(KV_DIR).join(kv_name);
        Self::with_db_name(&path.to_string_lossy())
    }

    /// Open or create the store at path `db_name`.
    pub fn with_db_name(db_name: &str) -> KvResult<Self> {
        // open before spawning so that the caller sees the error
        let db = open_db(db_name)?;
        let (sender, commands) = mpsc::unbounded_channel();
        tokio::spawn(serve(commands, db));
        Ok(Self { sender })
    }

    pub async fn reserve_key(&self, key: String) -> KvResult<KeyReservation> {
        self.request("reserve", |resp| Command::Reserve(key, resp))
            .await
    }

    /// Give up a reservation without putting a value.
    pub fn unreserve_key(&self, reservation: KeyReservation) {
        if self.sender.send(Command::Unreserve(reservation)).is_err() {
            warn!("kv store task is gone, reservation not released");
        }
    }

    pub async fn put(&self, reservation: KeyReservation, value: V) -> KvResult<()> {
        self.request("put", |resp| Command::Put(reservation, value, resp))
            .await
    }

    pub async fn replace(&self, key: &str, value: V) -> KvResult<()> {
        self.request("replace", |resp| {
            Command::Replace(key.to_string(), value, resp)
        })
        .await
    }

    pub async fn get(&self, key: &str) -> KvResult<V> {
        self.request("get", |resp| Command::Get(key.to_string(), resp))
            .await
    }

    pub async fn exists(&self, key: &str) -> KvResult<bool> {
        self.request("exists", |resp| Command::Exists(key.to_string(), resp))
            .await
    }

    pub async fn remove(&self, key: &str) -> KvResult<V> {
        self.request("remove", |resp| Command::Remove(key.to_string(), resp))
            .await
    }

    async fn request<T>(
        &self,
        op: &'static str,
        command: impl FnOnce(Responder<T>) -> Command<V>,
    ) -> KvResult<T> {
        let (resp, answer) = oneshot::channel();
        self.sender
            .send(command(resp))
            .map_err(|_| KvError::Closed)?;
        answer.await?.map_err(|source| KvError::Op { op, source })
    }
}

fn open_db(db_name: &str) -> sled::Result<sled::Db> {
    let db = sled::open(db_name)?;
    if db.was_recovered() {
        info!("opened existing kv store [{}]", db_name);
    } else {
        info!("created kv store [{}]", db_name);
    }
    Ok(db)
}

async fn serve<V>(mut commands: mpsc::UnboundedReceiver<Command<V>>, db: sled::Db)
where
    V: Serialize + DeserializeOwned,
{
    while let Some(command) = commands.recv().await {
        let answered = match command {
            Command::Reserve(key, resp) => resp.send(handle_reserve(&db, key)).is_ok(),
            Command::Unreserve(reservation) => {
                if let Err(err) = handle_unreserve(&db, reservation) {
                    warn!("cannot release reservation: {}", err);
                }
                true
            }
            Command::Put(reservation, value, resp) => {
                resp.send(handle_put(&db, reservation, value)).is_ok()
            }
            Command::Replace(key, value, resp) => {
                resp.send(handle_replace(&db, key, value)).is_ok()
            }
            Command::Get(key, resp) => resp.send(handle_get(&db, key)).is_ok(),
            Command::Exists(key, resp) => resp.send(handle_exists(&db, &key)).is_ok(),
            Command::Remove(key, resp) => resp.send(handle_remove(&db, key)).is_ok(),
        };
        if !answered {
            warn!("kv requester went away before the answer");
        }
    }
    if let Err(err) = db.flush_async().await {
        warn!("cannot flush kv store: {}", err);
    }
    info!("kv store task stopped");
}
