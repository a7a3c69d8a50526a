//! Drive one engine instance through its rounds.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, span, warn, Level, Span};

use super::{
    engine::{EngineChannels, EngineError, EngineMessage, EngineResult, MpcEngine, PartyContext},
    session::{Session, SessionGuard, SessionState},
    types::Party,
    TssServer,
};
use crate::{
    blame::{Blame, BlameManager, FailReason},
    p2p::Communication,
    router::{MessageType, OutboundEnvelope, OutboundRouter, SessionContext, SessionRouter},
};

/// What a session needs besides the engine and its input
pub(super) struct SessionParams<'a> {
    pub(super) msg_id: &'a str,
    pub(super) party: Arc<Party>,
    pub(super) threshold: usize,
    pub(super) message_type: MessageType,
    /// upper bound for the whole session, independent of round progress
    pub(super) timeout: Duration,
}

fn internal_blame() -> Blame {
    Blame::new(FailReason::InternalError, vec![])
}

impl TssServer {
    /// Run `engine` to completion over the peer network.
    /// Returns the engine output, or the blame for the failed session.
    pub(super) async fn execute_session<E>(
        &self,
        engine: &E,
        session: &mut Session,
        params: SessionParams<'_>,
        input: E::Input,
        span: Span,
    ) -> Result<E::Output, Blame>
    where
        E: MpcEngine + ?Sized,
    {
        let SessionParams {
            msg_id,
            party,
            threshold,
            message_type,
            timeout,
        } = params;
        let schedule = engine.rounds();
        let blame = Arc::new(BlameManager::new(party.clone(), schedule.clone(), threshold));

        // subscribe before anything is sent so that early peers are not lost
        let tss_msgs = self.router.subscribe(message_type, msg_id).map_err(|err| {
            error!("cannot subscribe to {}: {}", message_type, err);
            internal_blame()
        })?;
        let session_cancel = self.stop.child_token();
        let _guard = SessionGuard::new(
            msg_id,
            vec![message_type, message_type.verification()],
            self.router.clone(),
            self.stream_mgr.clone(),
            session_cancel.clone(),
        );
        let ver_msgs = self
            .router
            .subscribe(message_type.verification(), msg_id)
            .map_err(|err| {
                error!("cannot subscribe to {}: {}", message_type.verification(), err);
                internal_blame()
            })?;

        let ctx = PartyContext {
            msg_id: msg_id.to_string(),
            party: party.clone(),
            threshold,
        };
        let EngineChannels {
            mut outbound,
            inbound,
            mut done,
        } = engine.start(ctx, input).map_err(|err| {
            error!("cannot start engine: {}", err);
            internal_blame()
        })?;

        let (out_sender, out_receiver) = mpsc::unbounded_channel();
        let sender = tokio::spawn(send_outbound(self.communication.clone(), out_receiver));
        let session_ctx = SessionContext {
            msg_id: msg_id.to_string(),
            message_type,
            party,
            schedule,
            threshold,
            signer: self.signer.clone(),
            blame: blame.clone(),
            outbound: out_sender,
        };
        let dispatcher = tokio::spawn(SessionRouter::new(session_ctx.clone(), inbound).run(
            tss_msgs,
            ver_msgs,
            session_cancel.clone(),
        ));
        let outbound_router = OutboundRouter::new(session_ctx);

        let res = self
            .drive(
                session,
                &outbound_router,
                &mut outbound,
                &mut done,
                &blame,
                timeout,
                span,
            )
            .await;

        session_cancel.cancel();
        let _ = dispatcher.await;
        // the sender task ends once every handle to the outbound queue is gone
        drop(outbound_router);
        match &res {
            Ok(_) => {
                if tokio::time::timeout(self.cfg.stream_timeout, sender)
                    .await
                    .is_err()
                {
                    warn!("last messages of session {} not flushed in time", msg_id);
                }
            }
            Err(_) => sender.abort(),
        }
        res
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<O>(
        &self,
        session: &mut Session,
        outbound_router: &OutboundRouter,
        outbound: &mut mpsc::Receiver<EngineMessage>,
        done: &mut oneshot::Receiver<EngineResult<O>>,
        blame: &BlameManager,
        timeout: Duration,
        span: Span,
    ) -> Result<O, Blame> {
        let mut round = String::new();

        // Logs of concurrent sessions get scrambled when async code runs
        // inside an entered span, so every log line enters a temporary span
        // that carries the current round.
        macro_rules! round_info {
            ($e:expr $(, $opt:expr)* ) => {
                let round_span = span!(parent: &span, Level::INFO, "", round = round.as_str());
                let _start = round_span.enter();
                info!($e $(, $opt)*);
            };
        }

        let session_deadline = Instant::now() + timeout;
        let mut round_deadline = Instant::now() + self.cfg.round_timeout;
        let mut outbound_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    round_info!("stopped");
                    return Err(internal_blame());
                }
                msg = outbound.recv(), if outbound_open => match msg {
                    Some(msg) => {
                        if msg.round != round {
                            round = msg.round.clone();
                            round_deadline = Instant::now() + self.cfg.round_timeout;
                            round_info!("begin");
                        }
                        if let Err(err) = outbound_router.process_out(msg) {
                            error!("cannot send engine output: {}", err);
                            return Err(blame.stalled_session_blame(FailReason::InternalError));
                        }
                    }
                    None => outbound_open = false,
                },
                res = &mut *done => {
                    // output produced right before completion still goes out
                    while let Ok(msg) = outbound.try_recv() {
                        if let Err(err) = outbound_router.process_out(msg) {
                            warn!("dropping final engine output: {}", err);
                        }
                    }
                    round_info!("engine finished");
                    return engine_result(res, blame);
                }
                _ = sleep_until(session_deadline.min(round_deadline)) => {
                    if let Err(err) = session.transition(SessionState::TimedOut) {
                        warn!("{}", err);
                    }
                    let res = blame.stalled_session_blame(FailReason::Timeout);
                    round_info!("timed out: {}", res);
                    return Err(res);
                }
            }
        }
    }
}

fn engine_result<O>(
    res: Result<EngineResult<O>, oneshot::error::RecvError>,
    blame: &BlameManager,
) -> Result<O, Blame> {
    match res {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(EngineError::Culprits {
            culprits,
            round,
            is_unicast,
        })) => {
            let res = blame.culprit_blame(&culprits, &round, is_unicast);
            warn!("engine blamed parties {:?}: {}", culprits, res);
            Err(res)
        }
        Ok(Err(EngineError::Internal(reason))) => {
            error!("engine failure: {}", reason);
            Err(blame.stalled_session_blame(FailReason::InternalError))
        }
        Err(_) => {
            error!("engine exited without a result");
            Err(blame.stalled_session_blame(FailReason::InternalError))
        }
    }
}

/// Deliver queued envelopes in order until the queue closes.
async fn send_outbound(
    communication: Arc<Communication>,
    mut envelopes: mpsc::UnboundedReceiver<OutboundEnvelope>,
) {
    while let Some(OutboundEnvelope { peers, wrapper }) = envelopes.recv().await {
        let delivered = communication.send_to(&peers, &wrapper).await;
        if delivered < peers.len() {
            debug!(
                "{} of {} deliveries of {} {} succeeded",
                delivered,
                peers.len(),
                wrapper.message_type,
                wrapper.msg_id
            );
        }
    }
}
