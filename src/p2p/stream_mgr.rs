//! Keeps the streams used by a session alive until the session ends.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tracing::debug;

use super::PeerStream;

/// Bucket for streams whose session could not be determined
pub const UNKNOWN_STREAM: &str = "UNKNOWN";

#[derive(Default)]
pub struct StreamMgr {
    streams: Mutex<HashMap<String, Vec<Box<dyn PeerStream>>>>,
}

impl StreamMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stream(&self, msg_id: &str, stream: Box<dyn PeerStream>) {
        self.lock()
            .entry(msg_id.to_string())
            .or_default()
            .push(stream);
    }

    /// Reset every stream recorded under `msg_id`, plus all unattributed ones.
    pub fn release_stream(&self, msg_id: &str) {
        let released: Vec<_> = {
            let mut streams = self.lock();
            [msg_id, UNKNOWN_STREAM]
                .iter()
                .filter_map(|key| streams.remove(*key))
                .flatten()
                .collect()
        };
        debug!("release {} streams of session {}", released.len(), msg_id);
        for mut stream in released {
            stream.reset();
        }
    }

    pub fn stream_count(&self, msg_id: &str) -> usize {
        self.lock().get(msg_id).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Box<dyn PeerStream>>>> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
