//! Distributed key generation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, span, warn, Instrument, Level};

use super::{
    join_party_blame,
    protocol::SessionParams,
    session::{Session, SessionState},
    types::{get_threshold, Party, Request},
    Status, TssServer,
};
use crate::{
    blame::{Blame, FailReason},
    join_party::JoinPartyRequest,
    kv_manager::KeygenLocalState,
    router::MessageType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenRequest {
    /// pubkeys of all participants
    pub keys: Vec<String>,
    pub block_height: i64,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenResponse {
    /// hex-encoded pool public key, empty on failure
    pub pub_key: String,
    pub status: Status,
    pub blame: Blame,
}

impl KeygenResponse {
    fn success(pub_key: String) -> Self {
        Self {
            pub_key,
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    fn fail(blame: Blame) -> Self {
        Self {
            pub_key: String::new(),
            status: Status::Fail,
            blame,
        }
    }
}

/// Move `session` to failed and hand `blame` back.
pub(super) fn fail_session(session: &mut Session, blame: Blame) -> Blame {
    if let Err(err) = session.transition(SessionState::Failed) {
        warn!("{}", err);
    }
    blame
}

impl TssServer {
    /// Generate a new pool key together with the peers in `req.keys`.
    /// On success the local share is persisted under the returned key.
    pub async fn keygen(&self, req: KeygenRequest) -> KeygenResponse {
        let msg_id = Request::Keygen(&req).digest();
        let keygen_span = span!(Level::INFO, "keygen", msg_id = msg_id.as_str(), height = req.block_height);
        let mut session = Session::new(&msg_id);

        let response = self
            .handle_keygen(&req, &mut session, keygen_span.clone())
            .instrument(keygen_span.clone())
            .await;

        let _enter = keygen_span.enter();
        match response.status {
            Status::Success => info!("keygen succeeded with key {}", response.pub_key),
            Status::Fail => warn!("keygen failed: {}", response.blame),
        }
        response
    }

    async fn handle_keygen(
        &self,
        req: &KeygenRequest,
        session: &mut Session,
        keygen_span: tracing::Span,
    ) -> KeygenResponse {
        let msg_id = session.msg_id().to_string();
        let local_key = self.signer.pubkey().to_string();

        let party = match Party::new(&req.keys, &local_key) {
            Ok(party) => Arc::new(party),
            Err(err) => {
                error!("invalid keygen request: {}", err);
                let blame = Blame::new(FailReason::InternalError, vec![]);
                return KeygenResponse::fail(fail_session(session, blame));
            }
        };
        let threshold = match get_threshold(party.len()) {
            Ok(threshold) => threshold,
            Err(err) => {
                error!("invalid keygen request: {}", err);
                let blame = Blame::new(FailReason::InternalError, vec![]);
                return KeygenResponse::fail(fail_session(session, blame));
            }
        };

        if let Err(err) = session.transition(SessionState::JoiningParty) {
            error!("{}", err);
            return KeygenResponse::fail(Blame::new(FailReason::InternalError, vec![]));
        }
        // keygen needs every participant online
        let join_req = JoinPartyRequest {
            msg_id: msg_id.clone(),
            keys: party.pubkeys(),
            threshold: party.len() - 1,
            block_height: req.block_height,
        };
        if let Err(err) = self.join_party(&join_req, &req.version).await {
            warn!("join party failed: {}", err);
            let blame = join_party_blame(&err, &join_req.keys, threshold);
            return KeygenResponse::fail(fail_session(session, blame));
        }

        if let Err(err) = session.transition(SessionState::Running) {
            error!("{}", err);
            let blame = Blame::new(FailReason::InternalError, vec![]);
            return KeygenResponse::fail(fail_session(session, blame));
        }
        let params = SessionParams {
            msg_id: &msg_id,
            party: party.clone(),
            threshold,
            message_type: MessageType::KeygenMsg,
            timeout: self.cfg.keygen_timeout,
        };
        let output = match self
            .execute_session(&*self.keygen_engine, session, params, (), keygen_span)
            .await
        {
            Ok(output) => output,
            Err(blame) => return KeygenResponse::fail(fail_session(session, blame)),
        };

        let pub_key = hex::encode(&output.pub_key);
        let state = KeygenLocalState {
            pub_key: pub_key.clone(),
            local_data: output.local_data,
            participant_keys: party.pubkeys(),
            local_party_key: local_key,
        };
        if let Err(err) = self.state_manager.save_local_state(state).await {
            error!("cannot persist keygen result: {}", err);
            let blame = Blame::new(FailReason::InternalError, vec![]);
            return KeygenResponse::fail(fail_session(session, blame));
        }
        self.save_address_book(&party).await;

        if let Err(err) = session.transition(SessionState::Succeeded) {
            warn!("{}", err);
        }
        KeygenResponse::success(pub_key)
    }
}
