//! Demultiplexes inbound messages to the session that subscribed for them.
//!
//! Sessions subscribe by `(MessageType, msg_id)`. Messages that arrive before
//! the matching subscription exists are held in a bounded pending buffer and
//! flushed, in arrival order, when the subscription is made.

mod broadcast;
pub mod messages;
mod session;


pub use messages::{BroadcastConfirm, MessageRouting, MessageType, MessageWrapper, WireMessage};
pub(crate) use session::{OutboundEnvelope, OutboundRouter, SessionContext, SessionRouter};

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{p2p::PeerId, TssResult};

/// max number of buffered messages for a single subscription key
pub const MAX_PENDING_PER_KEY: usize = 256;
/// max number of subscription keys with buffered messages
pub const MAX_PENDING_KEYS: usize = 128;

/// A message read from a peer stream, tagged with the authenticated sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub wrapper: MessageWrapper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Buffered,
    Dropped,
}

type SubscriptionKey = (MessageType, String);

#[derive(Default)]
struct Subscriptions {
    subscribers: HashMap<SubscriptionKey, mpsc::UnboundedSender<InboundMessage>>,
    pending: HashMap<SubscriptionKey, VecDeque<InboundMessage>>,
    // insertion order of `pending` keys, oldest first
    pending_order: VecDeque<SubscriptionKey>,
}

impl Subscriptions {
    fn take_pending(&mut self, key: &SubscriptionKey) -> Option<VecDeque<InboundMessage>> {
        let backlog = self.pending.remove(key)?;
        self.pending_order.retain(|k| k != key);
        Some(backlog)
    }

    fn buffer(&mut self, key: SubscriptionKey, msg: InboundMessage) -> RouteOutcome {
        if let Some(backlog) = self.pending.get_mut(&key) {
            if backlog.len() >= MAX_PENDING_PER_KEY {
                return RouteOutcome::Dropped;
            }
            backlog.push_back(msg);
            return RouteOutcome::Buffered;
        }

        if self.pending.len() >= MAX_PENDING_KEYS {
            if let Some(oldest) = self.pending_order.pop_front() {
                warn!(
                    "pending buffer full, evicting {} messages of session {}",
                    self.pending.get(&oldest).map_or(0, VecDeque::len),
                    oldest.1
                );
                self.pending.remove(&oldest);
            }
        }
        self.pending_order.push_back(key.clone());
        self.pending.insert(key, VecDeque::from([msg]));
        RouteOutcome::Buffered
    }
}

#[derive(Default)]
pub struct MessageRouter {
    subscriptions: Mutex<Subscriptions>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `(message_type, msg_id)`. Buffered messages for the key
    /// are delivered first, in arrival order.
    pub fn subscribe(
        &self,
        message_type: MessageType,
        msg_id: &str,
    ) -> TssResult<mpsc::UnboundedReceiver<InboundMessage>> {
        let key = (message_type, msg_id.to_string());
        let (tx, rx) = mpsc::unbounded_channel();

        // Sends happen outside the lock. Messages routed while a backlog is
        // being flushed land in a fresh backlog and are picked up by the
        // next iteration, so arrival order is kept.
        loop {
            let backlog = {
                let mut subs = self.lock();
                if subs.subscribers.contains_key(&key) {
                    return Err(anyhow!(
                        "{} messages of session {} already have a subscriber",
                        message_type,
                        msg_id
                    ));
                }
                match subs.take_pending(&key) {
                    Some(backlog) => backlog,
                    None => {
                        subs.subscribers.insert(key, tx);
                        debug!("subscribed to {} messages of session {}", message_type, msg_id);
                        return Ok(rx);
                    }
                }
            };
            for msg in backlog {
                // cannot fail: rx is still held here
                let _ = tx.send(msg);
            }
        }
    }

    /// Remove the subscription for `(message_type, msg_id)` and drop its buffered messages.
    pub fn cancel_subscribe(&self, message_type: MessageType, msg_id: &str) {
        let key = (message_type, msg_id.to_string());
        let mut subs = self.lock();
        subs.subscribers.remove(&key);
        subs.take_pending(&key);
    }

    pub fn route(&self, msg: InboundMessage) -> RouteOutcome {
        let key = (msg.wrapper.message_type, msg.wrapper.msg_id.clone());

        let subscriber = {
            let mut subs = self.lock();
            match subs.subscribers.get(&key) {
                Some(tx) => tx.clone(),
                None => {
                    let outcome = subs.buffer(key, msg);
                    if outcome == RouteOutcome::Dropped {
                        warn!("pending buffer of a session is full, message dropped");
                    }
                    return outcome;
                }
            }
        };

        match subscriber.send(msg) {
            Ok(()) => RouteOutcome::Delivered,
            Err(_) => {
                debug!("subscriber of session {} has gone away", key.1);
                RouteOutcome::Dropped
            }
        }
    }

    pub fn pending_count(&self, message_type: MessageType, msg_id: &str) -> usize {
        self.lock()
            .pending
            .get(&(message_type, msg_id.to_string()))
            .map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
