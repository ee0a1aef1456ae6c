//! Negotiation state machine.
//!
//! Owns the lifecycle of one offer/answer exchange: it sequences the
//! media engine operations, buffers remote candidates until a remote
//! description exists, and refuses signaling input that is illegal in
//! the current phase without corrupting session state. All entry points
//! run on the controller task; nothing here is called re-entrantly.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::media::{ConnectionState, EngineEventKind, MediaError, MediaSession};
use crate::protocol::{CandidatePayload, SdpKind, SignalEnvelope, SignalEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Uninitialized,
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    AwaitingLocalDescription,
    /// Offerer only: offer sent, answer not yet received.
    AwaitingRemoteAnswer,
    /// Answerer only: offer received, answer not yet produced.
    AwaitingAnswerCreation,
    /// Descriptions exchanged; the engine's connection-state callback
    /// decides the rest.
    ConnectionPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating(NegotiationPhase),
    Connected,
    Closed,
}

pub struct NegotiationMachine {
    media: Arc<dyn MediaSession>,
    outbound: mpsc::UnboundedSender<SignalEnvelope>,
    identity: String,
    state: NegotiationState,
    role: NegotiationRole,
    pending_remote_candidates: VecDeque<CandidatePayload>,
    local_description_set: bool,
    remote_description_set: bool,
}

impl NegotiationMachine {
    pub fn new(
        media: Arc<dyn MediaSession>,
        identity: impl Into<String>,
        outbound: mpsc::UnboundedSender<SignalEnvelope>,
    ) -> Self {
        Self {
            media,
            outbound,
            identity: identity.into(),
            state: NegotiationState::Idle,
            role: NegotiationRole::Uninitialized,
            pending_remote_candidates: VecDeque::new(),
            local_description_set: false,
            remote_description_set: false,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Begin negotiating as the offerer: create and publish an offer,
    /// then wait for the remote answer.
    pub async fn start_offer(&mut self) {
        if self.state != NegotiationState::Idle {
            tracing::warn!(
                target = "negotiation",
                state = ?self.state,
                "start_offer ignored outside Idle"
            );
            return;
        }
        self.role = NegotiationRole::Offerer;
        self.state = NegotiationState::Negotiating(NegotiationPhase::AwaitingLocalDescription);

        let offer = match self.media.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return self.fail("create_offer", err).await,
        };
        if let Err(err) = self.media.set_local_description(offer.clone()).await {
            return self.fail("set_local_description", err).await;
        }
        self.local_description_set = true;

        self.emit(SignalEnvelope::description(&self.identity, &offer));
        self.state = NegotiationState::Negotiating(NegotiationPhase::AwaitingRemoteAnswer);
        tracing::info!(target = "negotiation", "offer published, awaiting answer");
    }

    /// Entry point for every decoded inbound envelope.
    pub async fn handle(&mut self, envelope: SignalEnvelope) {
        if self.state == NegotiationState::Closed {
            tracing::debug!(
                target = "negotiation",
                event = %envelope.event.as_str(),
                "session closed; dropping envelope"
            );
            return;
        }
        match &envelope.event {
            SignalEvent::Offer => self.handle_offer(envelope).await,
            SignalEvent::Answer => self.handle_answer(envelope).await,
            SignalEvent::Candidate => self.handle_candidate(envelope).await,
            SignalEvent::Other(tag) => {
                tracing::debug!(
                    target = "negotiation",
                    event = %tag,
                    from = %envelope.user_name,
                    "ignoring unrecognized signaling event"
                );
            }
        }
    }

    async fn handle_offer(&mut self, envelope: SignalEnvelope) {
        if self.state != NegotiationState::Idle {
            tracing::warn!(
                target = "negotiation",
                state = ?self.state,
                from = %envelope.user_name,
                "offer received outside Idle; ignoring"
            );
            return;
        }
        let offer = match envelope.description_payload() {
            Ok(payload) if payload.sdp_type == SdpKind::Offer => payload,
            Ok(payload) => {
                tracing::warn!(
                    target = "negotiation",
                    sdp_type = ?payload.sdp_type,
                    "offer envelope carried a non-offer description; dropping"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(target = "negotiation", error = %err, "dropping offer");
                return;
            }
        };

        self.role = NegotiationRole::Answerer;
        self.state = NegotiationState::Negotiating(NegotiationPhase::AwaitingAnswerCreation);

        if let Err(err) = self.media.set_remote_description(offer).await {
            return self.fail("set_remote_description", err).await;
        }
        self.remote_description_set = true;
        if let Err(err) = self.flush_pending_candidates().await {
            return self.fail("add_ice_candidate", err).await;
        }

        let answer = match self.media.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return self.fail("create_answer", err).await,
        };
        if let Err(err) = self.media.set_local_description(answer.clone()).await {
            return self.fail("set_local_description", err).await;
        }
        self.local_description_set = true;

        self.emit(SignalEnvelope::description(&self.identity, &answer));
        self.state = NegotiationState::Negotiating(NegotiationPhase::ConnectionPending);
        tracing::info!(target = "negotiation", "answer published, awaiting connection");
    }

    async fn handle_answer(&mut self, envelope: SignalEnvelope) {
        if self.state != NegotiationState::Negotiating(NegotiationPhase::AwaitingRemoteAnswer) {
            tracing::warn!(
                target = "negotiation",
                state = ?self.state,
                from = %envelope.user_name,
                "answer received outside AwaitingRemoteAnswer; ignoring"
            );
            return;
        }
        let answer = match envelope.description_payload() {
            Ok(payload) if payload.sdp_type == SdpKind::Answer => payload,
            Ok(payload) => {
                tracing::warn!(
                    target = "negotiation",
                    sdp_type = ?payload.sdp_type,
                    "answer envelope carried a non-answer description; dropping"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(target = "negotiation", error = %err, "dropping answer");
                return;
            }
        };

        if let Err(err) = self.media.set_remote_description(answer).await {
            return self.fail("set_remote_description", err).await;
        }
        self.remote_description_set = true;
        if let Err(err) = self.flush_pending_candidates().await {
            return self.fail("add_ice_candidate", err).await;
        }

        self.state = NegotiationState::Negotiating(NegotiationPhase::ConnectionPending);
        tracing::info!(target = "negotiation", "answer applied, awaiting connection");
    }

    async fn handle_candidate(&mut self, envelope: SignalEnvelope) {
        let candidate = match envelope.candidate_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target = "negotiation", error = %err, "dropping candidate");
                return;
            }
        };

        if self.remote_description_set {
            if let Err(err) = self.media.add_ice_candidate(candidate).await {
                return self.fail("add_ice_candidate", err).await;
            }
        } else {
            self.pending_remote_candidates.push_back(candidate);
            tracing::debug!(
                target = "negotiation",
                buffered = self.pending_remote_candidates.len(),
                "candidate buffered until remote description is set"
            );
        }
    }

    /// Engine callback delivered through the controller's event channel.
    pub async fn handle_engine_event(&mut self, event: EngineEventKind) {
        match event {
            EngineEventKind::LocalCandidate(candidate) => {
                // Trickled immediately; only a session that never started
                // (or already ended) has nowhere to send them.
                if matches!(
                    self.state,
                    NegotiationState::Idle | NegotiationState::Closed
                ) {
                    tracing::debug!(
                        target = "negotiation",
                        state = ?self.state,
                        "discarding local candidate outside negotiation"
                    );
                    return;
                }
                self.emit(SignalEnvelope::candidate(&self.identity, &candidate));
            }
            EngineEventKind::ConnectionState(ConnectionState::Connected) => {
                if matches!(self.state, NegotiationState::Negotiating(_)) {
                    self.state = NegotiationState::Connected;
                    tracing::info!(target = "negotiation", "media session connected");
                } else {
                    tracing::debug!(
                        target = "negotiation",
                        state = ?self.state,
                        "connected callback outside negotiation; ignoring"
                    );
                }
            }
            EngineEventKind::ConnectionState(ConnectionState::Failed) => {
                tracing::warn!(target = "negotiation", "engine reported connection failure");
                self.close().await;
            }
            EngineEventKind::ConnectionState(ConnectionState::Closed) => {
                tracing::debug!(target = "negotiation", "engine reported connection closed");
                self.close().await;
            }
            EngineEventKind::RemoteTrack { kind, track_id } => {
                tracing::info!(
                    target = "negotiation",
                    kind = %kind,
                    track_id = %track_id,
                    "remote track received"
                );
            }
        }
    }

    /// Terminal: the session object is discarded afterwards; a fresh
    /// start builds a new machine over a new peer connection.
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.pending_remote_candidates.clear();
        if let Err(err) = self.media.close().await {
            tracing::warn!(target = "negotiation", error = %err, "engine close failed");
        }
        tracing::info!(target = "negotiation", "session closed");
    }

    async fn flush_pending_candidates(&mut self) -> Result<(), MediaError> {
        let flushed = self.pending_remote_candidates.len();
        while let Some(candidate) = self.pending_remote_candidates.pop_front() {
            self.media.add_ice_candidate(candidate).await?;
        }
        if flushed > 0 {
            tracing::debug!(target = "negotiation", flushed, "buffered candidates applied");
        }
        Ok(())
    }

    async fn fail(&mut self, op: &'static str, err: MediaError) {
        tracing::error!(
            target = "negotiation",
            op,
            error = %err,
            "negotiation aborted"
        );
        self.close().await;
    }

    fn emit(&self, envelope: Result<SignalEnvelope, serde_json::Error>) {
        match envelope {
            Ok(envelope) => {
                if self.outbound.send(envelope).is_err() {
                    tracing::debug!(target = "negotiation", "outbound channel closed");
                }
            }
            Err(err) => {
                tracing::warn!(target = "negotiation", error = %err, "failed to encode envelope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use crate::protocol::SessionDescriptionPayload;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockMedia {
        calls: Mutex<Vec<String>>,
        fail_op: Option<&'static str>,
    }

    impl MockMedia {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_op: None,
            })
        }

        fn failing_on(op: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_op: Some(op),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &'static str, detail: &str) -> Result<(), MediaError> {
            self.calls.lock().unwrap().push(if detail.is_empty() {
                op.to_string()
            } else {
                format!("{op}:{detail}")
            });
            if self.fail_op == Some(op) {
                return Err(MediaError::Operation {
                    op,
                    reason: "mock failure".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MediaSession for MockMedia {
        async fn create_offer(&self) -> Result<SessionDescriptionPayload, MediaError> {
            self.record("create_offer", "")?;
            Ok(SessionDescriptionPayload {
                sdp_type: SdpKind::Offer,
                sdp: "v=0\r\nmock-offer\r\n".into(),
            })
        }

        async fn create_answer(&self) -> Result<SessionDescriptionPayload, MediaError> {
            self.record("create_answer", "")?;
            Ok(SessionDescriptionPayload {
                sdp_type: SdpKind::Answer,
                sdp: "v=0\r\nmock-answer\r\n".into(),
            })
        }

        async fn set_local_description(
            &self,
            desc: SessionDescriptionPayload,
        ) -> Result<(), MediaError> {
            let _ = desc;
            self.record("set_local_description", "")
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescriptionPayload,
        ) -> Result<(), MediaError> {
            let _ = desc;
            self.record("set_remote_description", "")
        }

        async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError> {
            self.record("add_ice_candidate", &candidate.candidate)
        }

        async fn close(&self) -> Result<(), MediaError> {
            self.record("close", "")
        }
    }

    fn machine(media: Arc<MockMedia>) -> (NegotiationMachine, mpsc::UnboundedReceiver<SignalEnvelope>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            NegotiationMachine::new(media, "local-peer", outbound_tx),
            outbound_rx,
        )
    }

    fn candidate(n: u32) -> CandidatePayload {
        CandidatePayload {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.0.2.{n} 50000 typ host"),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
            username_fragment: None,
        }
    }

    fn candidate_envelope(n: u32) -> SignalEnvelope {
        SignalEnvelope::candidate("remote-peer", &candidate(n)).unwrap()
    }

    fn offer_envelope() -> SignalEnvelope {
        SignalEnvelope::description(
            "remote-peer",
            &SessionDescriptionPayload {
                sdp_type: SdpKind::Offer,
                sdp: "v=0\r\nremote-offer\r\n".into(),
            },
        )
        .unwrap()
    }

    fn answer_envelope() -> SignalEnvelope {
        SignalEnvelope::description(
            "remote-peer",
            &SessionDescriptionPayload {
                sdp_type: SdpKind::Answer,
                sdp: "v=0\r\nremote-answer\r\n".into(),
            },
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SignalEnvelope>) -> Vec<SignalEnvelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn offerer_happy_path_flushes_buffered_candidates_in_order() {
        let media = MockMedia::new();
        let (mut machine, mut outbound) = machine(media.clone());

        machine.start_offer().await;
        assert_eq!(
            machine.state(),
            NegotiationState::Negotiating(NegotiationPhase::AwaitingRemoteAnswer)
        );
        assert!(machine.local_description_set());
        assert!(!machine.remote_description_set());
        let sent = drain(&mut outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, SignalEvent::Offer);

        // Candidates trickle in before the answer: buffered, not applied.
        machine.handle(candidate_envelope(1)).await;
        machine.handle(candidate_envelope(2)).await;
        assert_eq!(machine.pending_remote_candidates(), 2);

        machine.handle(answer_envelope()).await;
        assert_eq!(
            machine.state(),
            NegotiationState::Negotiating(NegotiationPhase::ConnectionPending)
        );
        assert!(machine.remote_description_set());
        assert_eq!(machine.pending_remote_candidates(), 0);

        machine
            .handle_engine_event(EngineEventKind::ConnectionState(ConnectionState::Connected))
            .await;
        assert_eq!(machine.state(), NegotiationState::Connected);

        assert_eq!(
            media.calls(),
            vec![
                "create_offer".to_string(),
                "set_local_description".to_string(),
                "set_remote_description".to_string(),
                format!("add_ice_candidate:{}", candidate(1).candidate),
                format!("add_ice_candidate:{}", candidate(2).candidate),
            ]
        );
    }

    #[tokio::test]
    async fn answer_while_idle_is_ignored_without_adapter_calls() {
        let media = MockMedia::new();
        let (mut machine, mut outbound) = machine(media.clone());

        machine.handle(answer_envelope()).await;

        assert_eq!(machine.state(), NegotiationState::Idle);
        assert_eq!(machine.role(), NegotiationRole::Uninitialized);
        assert!(media.calls().is_empty());
        assert!(drain(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn offer_while_idle_turns_session_into_answerer() {
        let media = MockMedia::new();
        let (mut machine, mut outbound) = machine(media.clone());

        machine.handle(offer_envelope()).await;

        assert_eq!(machine.role(), NegotiationRole::Answerer);
        assert_eq!(
            machine.state(),
            NegotiationState::Negotiating(NegotiationPhase::ConnectionPending)
        );
        let sent = drain(&mut outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, SignalEvent::Answer);
        assert_eq!(
            media.calls(),
            vec![
                "set_remote_description",
                "create_answer",
                "set_local_description",
            ]
        );
    }

    #[tokio::test]
    async fn early_candidates_apply_before_answer_creation() {
        let media = MockMedia::new();
        let (mut machine, _outbound) = machine(media.clone());

        machine.handle(candidate_envelope(1)).await;
        machine.handle(candidate_envelope(2)).await;
        assert_eq!(machine.pending_remote_candidates(), 2);

        machine.handle(offer_envelope()).await;

        assert_eq!(
            media.calls(),
            vec![
                "set_remote_description".to_string(),
                format!("add_ice_candidate:{}", candidate(1).candidate),
                format!("add_ice_candidate:{}", candidate(2).candidate),
                "create_answer".to_string(),
                "set_local_description".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_candidate_does_not_fault_the_session() {
        let media = MockMedia::new();
        let (mut machine, _outbound) = machine(media.clone());

        machine.handle(offer_envelope()).await;
        machine.handle(candidate_envelope(1)).await;
        machine.handle(candidate_envelope(1)).await;

        assert_ne!(machine.state(), NegotiationState::Closed);
        let applies = media
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("add_ice_candidate"))
            .count();
        assert_eq!(applies, 2);
    }

    #[tokio::test]
    async fn set_local_failure_closes_without_publishing() {
        let media = MockMedia::failing_on("set_local_description");
        let (mut machine, mut outbound) = machine(media.clone());

        machine.start_offer().await;

        assert_eq!(machine.state(), NegotiationState::Closed);
        assert!(drain(&mut outbound).is_empty());
        assert_eq!(
            media.calls(),
            vec!["create_offer", "set_local_description", "close"]
        );
    }

    #[tokio::test]
    async fn invalid_candidate_payload_is_dropped_without_mutation() {
        let media = MockMedia::new();
        let (mut machine, _outbound) = machine(media.clone());

        machine
            .handle(SignalEnvelope {
                event: SignalEvent::Candidate,
                user_name: "remote-peer".into(),
                data: r#"{"candidate":42}"#.into(),
            })
            .await;

        assert_eq!(machine.state(), NegotiationState::Idle);
        assert_eq!(machine.pending_remote_candidates(), 0);
        assert!(media.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let media = MockMedia::new();
        let (mut machine, mut outbound) = machine(media.clone());

        machine
            .handle(SignalEnvelope {
                event: SignalEvent::Other("presence".into()),
                user_name: "remote-peer".into(),
                data: String::new(),
            })
            .await;

        assert_eq!(machine.state(), NegotiationState::Idle);
        assert!(media.calls().is_empty());
        assert!(drain(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn local_candidates_trickle_only_during_negotiation() {
        let media = MockMedia::new();
        let (mut machine, mut outbound) = machine(media.clone());

        machine
            .handle_engine_event(EngineEventKind::LocalCandidate(candidate(1)))
            .await;
        assert!(drain(&mut outbound).is_empty());

        machine.start_offer().await;
        drain(&mut outbound);
        machine
            .handle_engine_event(EngineEventKind::LocalCandidate(candidate(2)))
            .await;
        let sent = drain(&mut outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, SignalEvent::Candidate);
        assert_eq!(
            sent[0].candidate_payload().unwrap().candidate,
            candidate(2).candidate
        );
    }

    #[tokio::test]
    async fn engine_failure_closes_from_any_state() {
        let media = MockMedia::new();
        let (mut machine, _outbound) = machine(media.clone());

        machine.start_offer().await;
        machine
            .handle_engine_event(EngineEventKind::ConnectionState(ConnectionState::Failed))
            .await;

        assert_eq!(machine.state(), NegotiationState::Closed);
        assert!(media.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn second_offer_during_negotiation_is_a_protocol_violation() {
        let media = MockMedia::new();
        let (mut machine, mut outbound) = machine(media.clone());

        machine.handle(offer_envelope()).await;
        let first_calls = media.calls().len();
        drain(&mut outbound);

        machine.handle(offer_envelope()).await;

        assert_eq!(media.calls().len(), first_calls);
        assert!(drain(&mut outbound).is_empty());
        assert_eq!(
            machine.state(),
            NegotiationState::Negotiating(NegotiationPhase::ConnectionPending)
        );
    }
}
