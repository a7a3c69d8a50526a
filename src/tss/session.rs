//! Session lifecycle and cleanup.

use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    p2p::StreamMgr,
    router::{MessageRouter, MessageType},
    TssResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    JoiningParty,
    Running,
    Succeeded,
    TimedOut,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, JoiningParty)
                | (Created, Failed)
                | (JoiningParty, Running)
                | (JoiningParty, Failed)
                | (Running, Succeeded)
                | (Running, TimedOut)
                | (Running, Failed)
                | (TimedOut, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }
}

#[derive(Debug)]
pub struct Session {
    msg_id: String,
    state: SessionState,
}

impl Session {
    pub fn new(msg_id: &str) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            state: SessionState::Created,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> TssResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(anyhow!(
                "session {}: invalid transition {:?} -> {:?}",
                self.msg_id,
                self.state,
                next
            ));
        }
        info!("session {}: {:?} -> {:?}", self.msg_id, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Releases everything a running session holds when dropped: router
/// subscriptions, peer streams and the session's background tasks.
pub(crate) struct SessionGuard {
    msg_id: String,
    message_types: Vec<MessageType>,
    router: Arc<MessageRouter>,
    stream_mgr: Arc<StreamMgr>,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub(crate) fn new(
        msg_id: &str,
        message_types: Vec<MessageType>,
        router: Arc<MessageRouter>,
        stream_mgr: Arc<StreamMgr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            msg_id: msg_id.to_string(),
            message_types,
            router,
            stream_mgr,
            cancel,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        for message_type in &self.message_types {
            self.router.cancel_subscribe(*message_type, &self.msg_id);
        }
        self.stream_mgr.release_stream(&self.msg_id);
        debug!("session {} cleaned up", self.msg_id);
    }
}
