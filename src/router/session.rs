//! Per-session routing between the peer network and an engine instance.
//!
//! [SessionRouter] runs as the session's dispatcher task: it authenticates
//! inbound wire messages, runs the broadcast echo check and hands accepted
//! shares to the engine. [OutboundRouter] signs engine output and queues it
//! for the session's sender task.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    broadcast::{echo_quorum, Consensus, EchoCache, EchoItem, Settled},
    BroadcastConfirm, InboundMessage, MessageRouting, MessageType, MessageWrapper, WireMessage,
};
use crate::{
    blame::{BlameManager, Evidence},
    p2p::{PeerId, Signer},
    tss::{
        engine::{EngineMessage, InboundShare},
        types::{Party, RoundInfo, RoundSchedule},
    },
    TssResult,
};

/// A wrapped message together with its recipients
#[derive(Debug, Clone)]
pub(crate) struct OutboundEnvelope {
    pub(crate) peers: Vec<PeerId>,
    pub(crate) wrapper: MessageWrapper,
}

/// Everything the routers of one session share
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) msg_id: String,
    pub(crate) message_type: MessageType,
    pub(crate) party: Arc<Party>,
    pub(crate) schedule: RoundSchedule,
    pub(crate) threshold: usize,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) blame: Arc<BlameManager>,
    pub(crate) outbound: mpsc::UnboundedSender<OutboundEnvelope>,
}

impl SessionContext {
    fn wrap<T: serde::Serialize>(
        &self,
        message_type: MessageType,
        payload: &T,
    ) -> TssResult<MessageWrapper> {
        Ok(MessageWrapper {
            message_type,
            msg_id: self.msg_id.clone(),
            payload: bincode::serialize(payload)?,
        })
    }

    fn enqueue(&self, peers: Vec<PeerId>, wrapper: MessageWrapper) -> TssResult<()> {
        self.outbound
            .send(OutboundEnvelope { peers, wrapper })
            .map_err(|_| anyhow!("outbound queue of session {} is closed", self.msg_id))
    }
}

pub(crate) struct SessionRouter {
    ctx: SessionContext,
    echo: EchoCache,
    engine_in: mpsc::Sender<InboundShare>,
}

impl SessionRouter {
    pub(crate) fn new(ctx: SessionContext, engine_in: mpsc::Sender<InboundShare>) -> Self {
        Self {
            ctx,
            echo: EchoCache::default(),
            engine_in,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut tss_msgs: mpsc::UnboundedReceiver<InboundMessage>,
        mut ver_msgs: mpsc::UnboundedReceiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(msg) = tss_msgs.recv() => self.process_tss_msg(msg).await,
                Some(msg) = ver_msgs.recv() => self.process_ver_msg(msg).await,
                else => break,
            }
        }
        debug!("dispatcher of session {} stopped", self.ctx.msg_id);
    }

    async fn process_tss_msg(&mut self, msg: InboundMessage) {
        let wire: WireMessage = match bincode::deserialize(&msg.wrapper.payload) {
            Ok(wire) => wire,
            Err(err) => {
                warn!("undecodable protocol message from {}: {}", msg.from, err);
                return;
            }
        };
        if let Err(err) = self.check_wire_message(&msg.from, &wire) {
            warn!("dropping message from {}: {}", msg.from, err);
            return;
        }

        if !wire.is_broadcast() {
            self.update_local(wire).await;
            return;
        }

        let key = wire.cache_key();
        let hash = wire.payload_hash();
        let round = wire.routing.round.clone();
        let local = self.ctx.party.local_peer_id().clone();
        if !self.echo.set_message(&key, &local, wire) {
            debug!("duplicate broadcast {} ignored", key);
            return;
        }
        if let Err(err) = self.send_confirm(&key, round, hash) {
            warn!("cannot echo broadcast {}: {}", key, err);
        }
        self.apply_if_consensus(&key).await;
    }

    async fn process_ver_msg(&mut self, msg: InboundMessage) {
        let confirm: BroadcastConfirm = match bincode::deserialize(&msg.wrapper.payload) {
            Ok(confirm) => confirm,
            Err(err) => {
                warn!("undecodable echo from {}: {}", msg.from, err);
                return;
            }
        };
        if let Err(err) = self.check_confirm(&msg.from, &confirm) {
            warn!("dropping echo from {}: {}", msg.from, err);
            return;
        }
        match self.echo.settled(&confirm.key) {
            Some(Settled::Hash(hash)) if *hash != confirm.hash => {
                self.record_divergent_echo(&confirm);
                return;
            }
            Some(_) => {
                debug!("late echo from {} for {}", confirm.from, confirm.key);
                return;
            }
            None => {}
        }
        let key = confirm.key.clone();
        if !self.echo.add_confirmation(confirm) {
            debug!("repeated echo for {}", key);
            return;
        }
        self.apply_if_consensus(&key).await;
    }

    /// Authenticate an echo against the party and the authenticated transport sender.
    fn check_confirm(&self, transport_from: &PeerId, confirm: &BroadcastConfirm) -> TssResult<()> {
        if &confirm.from != transport_from {
            return Err(anyhow!("relays an echo of {}", confirm.from));
        }
        if confirm.msg_id != self.ctx.msg_id {
            return Err(anyhow!("belongs to session {}", confirm.msg_id));
        }
        if self.ctx.schedule.index_of(&confirm.round).is_none() {
            return Err(anyhow!("unknown round {}", confirm.round));
        }
        let pubkey = self
            .ctx
            .party
            .pubkey_of(&confirm.from)
            .ok_or_else(|| anyhow!("sender is not a party member"))?;
        if !self
            .ctx
            .signer
            .verify(pubkey, &confirm.signing_bytes()?, &confirm.signature)
        {
            return Err(anyhow!("invalid signature"));
        }
        Ok(())
    }

    /// Authenticate `wire` against the party and the authenticated transport sender.
    fn check_wire_message(&self, transport_from: &PeerId, wire: &WireMessage) -> TssResult<()> {
        let party = &self.ctx.party;
        let from = &wire.routing.from;
        if from != transport_from {
            return Err(anyhow!("claims to be from {}", from));
        }
        if wire.msg_id != self.ctx.msg_id {
            return Err(anyhow!("belongs to session {}", wire.msg_id));
        }
        if from == party.local_peer_id() {
            return Err(anyhow!("claims to be from the local peer"));
        }
        let pubkey = party
            .pubkey_of(from)
            .ok_or_else(|| anyhow!("sender is not a party member"))?;
        if let Some(to) = &wire.routing.to {
            if !to.contains(party.local_peer_id()) {
                return Err(anyhow!("not addressed to the local peer"));
            }
        }
        if self.ctx.schedule.index_of(&wire.routing.round).is_none() {
            return Err(anyhow!("unknown round {}", wire.routing.round));
        }
        if !self
            .ctx
            .signer
            .verify(pubkey, &wire.signing_bytes()?, &wire.signature)
        {
            return Err(anyhow!("invalid signature"));
        }
        Ok(())
    }

    fn send_confirm(&self, key: &str, round: String, hash: String) -> TssResult<()> {
        let mut confirm = BroadcastConfirm {
            from: self.ctx.party.local_peer_id().clone(),
            msg_id: self.ctx.msg_id.clone(),
            key: key.to_string(),
            round,
            hash,
            signature: vec![],
        };
        confirm.signature = self.ctx.signer.sign(&confirm.signing_bytes()?);
        let wrapper = self
            .ctx
            .wrap(self.ctx.message_type.verification(), &confirm)?;
        self.ctx.enqueue(self.ctx.party.peers_except_local(), wrapper)
    }

    async fn apply_if_consensus(&mut self, key: &str) {
        let party = &self.ctx.party;
        let quorum = echo_quorum(self.ctx.threshold, party.len());
        // everybody but the original sender echoes
        let receivers = party.len().saturating_sub(1);

        match self
            .echo
            .consensus(key, party.local_peer_id(), quorum, receivers)
        {
            Consensus::Pending => {}
            Consensus::Agreed { hash, divergent } => {
                let item = self.echo.settle(key, Settled::Hash(hash));
                if let Some(item) = item {
                    self.record_divergent_echoes(&item, &divergent);
                    if let Some(msg) = item.msg {
                        self.update_local(msg).await;
                    }
                }
            }
            Consensus::LocalMismatch { hash, divergent } => {
                let item = self.echo.settle(key, Settled::Hash(hash));
                if let Some(item) = item {
                    self.record_divergent_echoes(&item, &divergent);
                    self.record_equivocating_sender(item);
                }
            }
            Consensus::NoMajority => {
                if let Some(item) = self.echo.settle(key, Settled::NoMajority) {
                    self.record_equivocating_sender(item);
                }
            }
        }
    }

    fn record_equivocating_sender(&self, item: EchoItem) {
        let Some(msg) = item.msg else {
            return;
        };
        warn!(
            "broadcast {} of {} failed the hash check",
            msg.cache_key(),
            msg.routing.from
        );
        self.ctx.blame.record_equivocation(
            msg.routing.from.clone(),
            Evidence {
                round: msg.routing.round,
                data: msg.payload,
                signature: msg.signature,
            },
        );
    }

    fn record_divergent_echoes(&self, item: &EchoItem, divergent: &[PeerId]) {
        for peer in divergent {
            if let Some(confirm) = item.echo_of(peer) {
                self.record_divergent_echo(confirm);
            }
        }
    }

    /// The signed echo is the evidence: it commits `from` to a hash the quorum did not see.
    fn record_divergent_echo(&self, confirm: &BroadcastConfirm) {
        warn!("{} echoed a different hash for {}", confirm.from, confirm.key);
        let data = match confirm.signing_bytes() {
            Ok(data) => data,
            Err(err) => {
                warn!("cannot encode echo of {}: {}", confirm.from, err);
                return;
            }
        };
        self.ctx.blame.record_equivocation(
            confirm.from.clone(),
            Evidence {
                round: confirm.round.clone(),
                data,
                signature: confirm.signature.clone(),
            },
        );
    }

    /// Accept a share at most once per sender and round, then pass it to the engine.
    async fn update_local(&mut self, wire: WireMessage) {
        let from = wire.routing.from.clone();
        let (Some(round_index), Some(from_index)) = (
            self.ctx.schedule.index_of(&wire.routing.round),
            self.ctx.party.index_of(&from),
        ) else {
            return;
        };

        let round_info = RoundInfo {
            index: round_index,
            round: wire.routing.round.clone(),
            msg_id: self.ctx.msg_id.clone(),
        };
        if !self.ctx.blame.update_accepted_share(round_info, &from) {
            warn!(
                "share of {} for {} already accepted, ignoring",
                from, wire.routing.round
            );
            return;
        }

        let share = InboundShare {
            from: from_index,
            round: wire.routing.round.clone(),
            is_broadcast: wire.is_broadcast(),
            payload: wire.payload.clone(),
        };
        self.ctx.blame.set_round_msg(wire);
        if self.engine_in.send(share).await.is_err() {
            debug!("engine of session {} no longer takes input", self.ctx.msg_id);
        }
    }
}

/// Signs engine output and hands it to the sender task
pub(crate) struct OutboundRouter {
    ctx: SessionContext,
}

impl OutboundRouter {
    pub(crate) fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    pub(crate) fn process_out(&self, msg: EngineMessage) -> TssResult<()> {
        let party = &self.ctx.party;
        let to = match &msg.to {
            None => None,
            Some(indices) => Some(
                indices
                    .iter()
                    .map(|i| party.peer_id_of(*i).cloned())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| anyhow!("engine addressed an unknown party index"))?,
            ),
        };

        let mut wire = WireMessage {
            routing: MessageRouting {
                from: party.local_peer_id().clone(),
                to: to.clone(),
                round: msg.round,
            },
            msg_id: self.ctx.msg_id.clone(),
            payload: msg.payload,
            signature: vec![],
        };
        wire.signature = self.ctx.signer.sign(&wire.signing_bytes()?);

        let peers = to.unwrap_or_else(|| party.peers_except_local());
        let wrapper = self.ctx.wrap(self.ctx.message_type, &wire)?;
        self.ctx.blame.set_last_msg(wire);
        self.ctx.enqueue(peers, wrapper)
    }
}
