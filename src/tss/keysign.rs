//! Threshold signing with a previously generated pool key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, span, warn, Instrument, Level, Span};

use super::{
    engine::{KeysignInput, Signature},
    join_party_blame,
    keygen::fail_session,
    protocol::SessionParams,
    session::{Session, SessionState},
    types::{get_threshold, Party, Request},
    Status, TssServer,
};
use crate::{
    blame::{node_sync_blame, Blame, FailReason},
    join_party::JoinPartyRequest,
    p2p::PeerId,
    router::MessageType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignRequest {
    /// hex-encoded pool key as returned by keygen
    pub pool_pub_key: String,
    /// messages to sign, opaque to the core
    pub messages: Vec<String>,
    pub signer_pub_keys: Vec<String>,
    pub block_height: i64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signatures: Vec<Signature>,
    pub status: Status,
    pub blame: Blame,
}

impl KeysignResponse {
    fn success(signatures: Vec<Signature>) -> Self {
        Self {
            signatures,
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    fn fail(blame: Blame) -> Self {
        Self {
            signatures: vec![],
            status: Status::Fail,
            blame,
        }
    }
}

fn internal_failure(session: &mut Session) -> KeysignResponse {
    KeysignResponse::fail(fail_session(
        session,
        Blame::new(FailReason::InternalError, vec![]),
    ))
}

impl TssServer {
    /// Sign `req.messages` with the pool key together with `req.signer_pub_keys`.
    pub async fn keysign(&self, req: KeysignRequest) -> KeysignResponse {
        let msg_id = Request::Keysign(&req).digest();
        let keysign_span = span!(
            Level::INFO,
            "keysign",
            msg_id = msg_id.as_str(),
            key = req.pool_pub_key.as_str(),
            height = req.block_height
        );
        let mut session = Session::new(&msg_id);

        let response = self
            .handle_keysign(&req, &mut session, keysign_span.clone())
            .instrument(keysign_span.clone())
            .await;

        let _enter = keysign_span.enter();
        match response.status {
            Status::Success => info!("signed {} messages", response.signatures.len()),
            Status::Fail => warn!("keysign failed: {}", response.blame),
        }
        response
    }

    async fn handle_keysign(
        &self,
        req: &KeysignRequest,
        session: &mut Session,
        keysign_span: Span,
    ) -> KeysignResponse {
        let msg_id = session.msg_id().to_string();
        let local_key = self.signer.pubkey().to_string();

        if req.messages.is_empty() {
            error!("nothing to sign");
            return internal_failure(session);
        }
        let local_state = match self.state_manager.get_local_state(&req.pool_pub_key).await {
            Ok(local_state) => local_state,
            Err(err) => {
                error!("no local state for key {}: {}", req.pool_pub_key, err);
                return internal_failure(session);
            }
        };
        let threshold = match get_threshold(local_state.participant_keys.len()) {
            Ok(threshold) => threshold,
            Err(err) => {
                error!("corrupt local state: {}", err);
                return internal_failure(session);
            }
        };

        let mut signer_keys = req.signer_pub_keys.clone();
        signer_keys.sort();
        signer_keys.dedup();
        if let Some(outsider) = signer_keys
            .iter()
            .find(|key| !local_state.participant_keys.contains(*key))
        {
            error!("signer {} did not take part in keygen", outsider);
            return internal_failure(session);
        }
        if !signer_keys.contains(&local_key) {
            let blame = Blame::new(FailReason::NotSelected, vec![]);
            return KeysignResponse::fail(fail_session(session, blame));
        }
        if signer_keys.len() < threshold + 1 {
            error!(
                "{} signers cannot meet threshold {}",
                signer_keys.len(),
                threshold
            );
            return internal_failure(session);
        }

        if let Err(err) = session.transition(SessionState::JoiningParty) {
            error!("{}", err);
            return KeysignResponse::fail(Blame::new(FailReason::InternalError, vec![]));
        }
        let join_req = JoinPartyRequest {
            msg_id: msg_id.clone(),
            keys: signer_keys.clone(),
            threshold,
            block_height: req.block_height,
        };
        let outcome = match self.join_party(&join_req, &req.version).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("join party failed: {}", err);
                let blame = join_party_blame(&err, &signer_keys, threshold);
                return KeysignResponse::fail(fail_session(session, blame));
            }
        };
        info!("joined party led by {}", outcome.leader_label());

        let signers: Vec<String> = signer_keys
            .iter()
            .filter(|key| outcome.online.contains(&PeerId::from_pubkey(key)))
            .cloned()
            .collect();
        if signers.len() < threshold + 1 {
            let blame = Blame::new(
                FailReason::SyncFail,
                node_sync_blame(&signer_keys, &outcome.online),
            );
            return KeysignResponse::fail(fail_session(session, blame));
        }
        let party = match Party::new(&signers, &local_key) {
            Ok(party) => Arc::new(party),
            Err(err) => {
                error!("invalid signing party: {}", err);
                return internal_failure(session);
            }
        };

        if let Err(err) = session.transition(SessionState::Running) {
            error!("{}", err);
            return internal_failure(session);
        }
        let params = SessionParams {
            msg_id: &msg_id,
            party,
            threshold,
            message_type: MessageType::KeysignMsg,
            timeout: self.cfg.keysign_timeout,
        };
        let input = KeysignInput {
            local_state,
            messages: req.messages.clone(),
        };
        match self
            .execute_session(&*self.keysign_engine, session, params, input, keysign_span)
            .await
        {
            Ok(signatures) => {
                if let Err(err) = session.transition(SessionState::Succeeded) {
                    warn!("{}", err);
                }
                KeysignResponse::success(signatures)
            }
            Err(blame) => KeysignResponse::fail(fail_session(session, blame)),
        }
    }
}
