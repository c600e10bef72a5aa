//! Per-connection offer/answer/candidate state machine.
//!
//! Answerer path: `Idle -> OfferReceived -> AnswerSent`.
//! Offerer path: `Idle -> AnswerReceived -> Negotiated`.
//! Any collaborator failure moves the machine to `Failed`; a fresh offer
//! restarts it.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MediaError, NegotiationError};
use crate::media::{MediaPeer, SdpKind};
use crate::registry::SharedRegistry;
use crate::signaling::{SignalKind, SignalMessage};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Negotiated,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::OfferReceived => "offer_received",
            Phase::AnswerSent => "answer_sent",
            Phase::AnswerReceived => "answer_received",
            Phase::Negotiated => "negotiated",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything one connection knows about its negotiation
#[derive(Debug, Default)]
pub struct NegotiationState {
    phase: Phase,
    local_description: Option<String>,
    remote_description: Option<String>,
    /// Candidates that arrived before any remote description (trickle), FIFO.
    pending_candidates: VecDeque<String>,
    round: u64,
    /// Start of the current unsettled stretch, for the optional timeout.
    unsettled_since: Option<Instant>,
}

impl NegotiationState {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub fn local_description(&self) -> Option<&str> {
        self.local_description.as_deref()
    }

    #[cfg(test)]
    pub fn remote_description(&self) -> Option<&str> {
        self.remote_description.as_deref()
    }

    #[cfg(test)]
    pub fn pending_candidates(&self) -> impl Iterator<Item = &str> {
        self.pending_candidates.iter().map(String::as_str)
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    fn is_unsettled(&self) -> bool {
        match self.phase {
            Phase::OfferReceived => true,
            Phase::Idle => !self.pending_candidates.is_empty(),
            _ => false,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        if self.is_unsettled() {
            self.unsettled_since.get_or_insert_with(Instant::now);
        } else {
            self.unsettled_since = None;
        }
    }

    fn reset_round(&mut self) {
        self.local_description = None;
        self.remote_description = None;
        self.enter(Phase::Idle);
    }
}

/// Dispatches decoded messages of one connection into its state machine.
pub struct Negotiation {
    state: NegotiationState,
    peer: Box<dyn MediaPeer>,
    registry: SharedRegistry,
    session_id: String,
    connection_id: String,
}

impl Negotiation {
    pub fn new(
        peer: Box<dyn MediaPeer>,
        registry: SharedRegistry,
        session_id: String,
        connection_id: String,
    ) -> Self {
        Self {
            state: NegotiationState::default(),
            peer,
            registry,
            session_id,
            connection_id,
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    /// Apply one inbound message. Returns the messages to send back on the
    /// same connection.
    pub async fn dispatch(
        &mut self,
        message: &SignalMessage,
    ) -> Result<Vec<SignalMessage>, NegotiationError> {
        debug!(
            "connection {} dispatching {} while {}",
            self.connection_id, message.kind, self.state.phase
        );
        match message.kind {
            SignalKind::Offer => self.on_offer(&message.data).await,
            SignalKind::Answer => self.on_answer(&message.data).await.map(|_| Vec::new()),
            SignalKind::Candidate => self.on_candidate(&message.data).await.map(|_| Vec::new()),
        }
    }

    async fn on_offer(&mut self, sdp: &str) -> Result<Vec<SignalMessage>, NegotiationError> {
        if self.state.remote_description.is_some() || self.state.phase == Phase::Failed {
            info!(
                "connection {} renegotiating: resetting round {} ({})",
                self.connection_id, self.state.round, self.state.phase
            );
            self.state.reset_round();
        }
        self.state.round += 1;

        if let Err(err) = self.peer.set_remote_description(SdpKind::Offer, sdp).await {
            return Err(self.fail(err));
        }
        self.state.remote_description = Some(sdp.to_string());
        self.state.enter(Phase::OfferReceived);
        self.registry.put_offer(&self.session_id, sdp);
        self.flush_pending().await?;

        let answer = match self.peer.create_answer().await {
            Ok(Some(answer)) => answer,
            Ok(None) => return Ok(Vec::new()),
            Err(err) => return Err(self.fail(err)),
        };
        if let Err(err) = self.peer.set_local_description(SdpKind::Answer, &answer).await {
            return Err(self.fail(err));
        }
        self.state.local_description = Some(answer.clone());
        self.state.enter(Phase::AnswerSent);
        Ok(vec![SignalMessage::answer(answer)])
    }

    async fn on_answer(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        match self.state.phase {
            Phase::Idle | Phase::OfferReceived => {}
            phase => {
                return Err(NegotiationError::OutOfOrder {
                    kind: SignalKind::Answer,
                    phase,
                })
            }
        }

        if let Err(err) = self.peer.set_remote_description(SdpKind::Answer, sdp).await {
            return Err(self.fail(err));
        }
        self.state.remote_description = Some(sdp.to_string());
        self.state.enter(Phase::AnswerReceived);
        self.flush_pending().await?;
        self.state.enter(Phase::Negotiated);
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: &str) -> Result<(), NegotiationError> {
        if self.state.phase == Phase::Failed {
            debug!(
                "connection {} discarding candidate after failure",
                self.connection_id
            );
            return Ok(());
        }

        if self.state.remote_description.is_none() {
            self.state.pending_candidates.push_back(candidate.to_string());
            // no remote description yet means no round has started
            self.state.enter(Phase::Idle);
            debug!(
                "connection {} buffered candidate ({} pending)",
                self.connection_id,
                self.state.pending_candidates.len()
            );
            return Ok(());
        }

        if let Err(err) = self.peer.add_ice_candidate(candidate).await {
            return Err(self.fail(err));
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), NegotiationError> {
        if !self.state.pending_candidates.is_empty() {
            debug!(
                "connection {} flushing {} buffered candidates",
                self.connection_id,
                self.state.pending_candidates.len()
            );
        }
        while let Some(candidate) = self.state.pending_candidates.pop_front() {
            if let Err(err) = self.peer.add_ice_candidate(&candidate).await {
                return Err(self.fail(err));
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: MediaError) -> NegotiationError {
        self.state.pending_candidates.clear();
        self.state.enter(Phase::Failed);
        NegotiationError::Media(err)
    }

    /// When the current negotiation stalls past `timeout`, if it is unsettled.
    pub fn stall_deadline(&self, timeout: Duration) -> Option<Instant> {
        if !self.state.is_unsettled() {
            return None;
        }
        self.state.unsettled_since.map(|since| since + timeout)
    }

    /// Give up on a stalled negotiation.
    pub fn expire(&mut self) {
        warn!(
            "connection {} negotiation stalled in {}, marking failed ({} buffered candidates dropped)",
            self.connection_id,
            self.state.phase,
            self.state.pending_candidates.len()
        );
        self.state.pending_candidates.clear();
        self.state.enter(Phase::Failed);
    }

    pub async fn close(self) {
        if let Err(err) = self.peer.close().await {
            debug!("connection {} media peer close failed: {}", self.connection_id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{Call, MockPeer};
    use crate::registry::SessionRegistry;
    use std::sync::Arc;

    fn negotiation(peer: &MockPeer) -> (Negotiation, SharedRegistry) {
        let registry = Arc::new(SessionRegistry::default());
        let negotiation = Negotiation::new(
            Box::new(peer.clone()),
            Arc::clone(&registry),
            "room1".to_string(),
            "conn-1".to_string(),
        );
        (negotiation, registry)
    }

    #[tokio::test]
    async fn offer_produces_exactly_one_answer() {
        let peer = MockPeer::answering("SDP-B");
        let (mut negotiation, registry) = negotiation(&peer);

        let replies = negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();

        assert_eq!(replies, vec![SignalMessage::answer("SDP-B")]);
        assert_eq!(negotiation.state().phase(), Phase::AnswerSent);
        assert_eq!(negotiation.state().remote_description(), Some("SDP-A"));
        assert_eq!(negotiation.state().local_description(), Some("SDP-B"));
        assert_eq!(registry.get_offer("room1").as_deref(), Some("SDP-A"));
        assert_eq!(
            peer.calls(),
            vec![
                Call::SetRemote(SdpKind::Offer, "SDP-A".into()),
                Call::CreateAnswer,
                Call::SetLocal(SdpKind::Answer, "SDP-B".into()),
            ]
        );
    }

    #[tokio::test]
    async fn silent_peer_leaves_offer_received() {
        let peer = MockPeer::silent();
        let (mut negotiation, _) = negotiation(&peer);

        let replies = negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(negotiation.state().phase(), Phase::OfferReceived);
    }

    #[tokio::test]
    async fn early_candidates_flush_in_order_after_offer() {
        let peer = MockPeer::answering("SDP-B");
        let (mut negotiation, _) = negotiation(&peer);

        for c in ["c1", "c2", "c3"] {
            negotiation
                .dispatch(&SignalMessage::candidate(c))
                .await
                .unwrap();
        }
        let pending: Vec<&str> = negotiation.state().pending_candidates().collect();
        assert_eq!(pending, vec!["c1", "c2", "c3"]);
        assert!(peer.candidates().is_empty());

        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();

        assert_eq!(peer.candidates(), vec!["c1", "c2", "c3"]);
        assert_eq!(negotiation.state().pending_candidates().count(), 0);
        // remote description is applied before any buffered candidate
        assert_eq!(
            peer.calls().first(),
            Some(&Call::SetRemote(SdpKind::Offer, "SDP-A".into()))
        );
    }

    #[tokio::test]
    async fn candidate_after_remote_description_is_forwarded_immediately() {
        let peer = MockPeer::answering("SDP-B");
        let (mut negotiation, _) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();
        negotiation
            .dispatch(&SignalMessage::candidate("c9"))
            .await
            .unwrap();

        assert_eq!(peer.candidates(), vec!["c9"]);
        assert_eq!(negotiation.state().phase(), Phase::AnswerSent);
    }

    #[tokio::test]
    async fn replayed_offer_is_idempotent() {
        let peer = MockPeer::answering("SDP-B");
        let (mut negotiation, _) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::candidate("c1"))
            .await
            .unwrap();
        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();
        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();

        assert_eq!(negotiation.state().remote_description(), Some("SDP-A"));
        assert_eq!(peer.candidates(), vec!["c1"]);
        assert_eq!(negotiation.state().round(), 2);
    }

    #[tokio::test]
    async fn answer_completes_offerer_path() {
        let peer = MockPeer::silent();
        let (mut negotiation, registry) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::candidate("c1"))
            .await
            .unwrap();
        let replies = negotiation
            .dispatch(&SignalMessage::answer("SDP-B"))
            .await
            .unwrap();

        assert!(replies.is_empty());
        assert_eq!(negotiation.state().phase(), Phase::Negotiated);
        assert_eq!(negotiation.state().remote_description(), Some("SDP-B"));
        assert_eq!(peer.candidates(), vec!["c1"]);
        // answers are never published as offers
        assert_eq!(registry.get_offer("room1"), None);
    }

    #[tokio::test]
    async fn answer_while_offer_received_negotiates() {
        let peer = MockPeer::silent();
        let (mut negotiation, _) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();
        assert_eq!(negotiation.state().phase(), Phase::OfferReceived);

        let replies = negotiation
            .dispatch(&SignalMessage::answer("SDP-B"))
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(negotiation.state().phase(), Phase::Negotiated);
        assert_eq!(negotiation.state().remote_description(), Some("SDP-B"));
        assert_eq!(
            peer.calls().last(),
            Some(&Call::SetRemote(SdpKind::Answer, "SDP-B".into()))
        );
    }

    #[tokio::test]
    async fn answer_after_negotiated_is_out_of_order() {
        let peer = MockPeer::silent();
        let (mut negotiation, _) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::answer("SDP-B"))
            .await
            .unwrap();
        let err = negotiation
            .dispatch(&SignalMessage::answer("SDP-C"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            NegotiationError::OutOfOrder {
                kind: SignalKind::Answer,
                phase: Phase::Negotiated
            }
        ));
        assert_eq!(negotiation.state().phase(), Phase::Negotiated);
        assert_eq!(negotiation.state().remote_description(), Some("SDP-B"));
    }

    #[tokio::test]
    async fn collaborator_failure_moves_to_failed() {
        let peer = MockPeer::answering("SDP-B");
        peer.fail_on("set_remote_description");
        let (mut negotiation, registry) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::candidate("c1"))
            .await
            .unwrap();
        let err = negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::Media(_)));
        assert_eq!(negotiation.state().phase(), Phase::Failed);
        assert_eq!(negotiation.state().remote_description(), None);
        assert_eq!(registry.get_offer("room1"), None);
    }

    #[tokio::test]
    async fn rejected_local_answer_is_never_sent() {
        let peer = MockPeer::answering("SDP-B");
        peer.fail_on("set_local_description");
        let (mut negotiation, _) = negotiation(&peer);

        let err = negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::Media(_)));
        assert_eq!(negotiation.state().phase(), Phase::Failed);
        assert_eq!(negotiation.state().local_description(), None);
        assert_eq!(
            peer.calls().last(),
            Some(&Call::SetLocal(SdpKind::Answer, "SDP-B".into()))
        );
    }

    #[tokio::test]
    async fn candidates_after_failure_are_discarded() {
        let peer = MockPeer::answering("SDP-B");
        peer.fail_on("create_answer");
        let (mut negotiation, _) = negotiation(&peer);

        assert!(negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .is_err());
        assert_eq!(negotiation.state().phase(), Phase::Failed);

        negotiation
            .dispatch(&SignalMessage::candidate("late"))
            .await
            .unwrap();
        assert!(peer.candidates().is_empty());
        assert_eq!(negotiation.state().pending_candidates().count(), 0);
    }

    #[tokio::test]
    async fn fresh_offer_restarts_after_failure() {
        let peer = MockPeer::answering("SDP-B");
        peer.fail_on("add_ice_candidate");
        let (mut negotiation, _) = negotiation(&peer);

        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();
        assert!(negotiation
            .dispatch(&SignalMessage::candidate("c1"))
            .await
            .is_err());
        assert_eq!(negotiation.state().phase(), Phase::Failed);

        peer.recover();
        let replies = negotiation
            .dispatch(&SignalMessage::offer("SDP-A2"))
            .await
            .unwrap();
        assert_eq!(replies, vec![SignalMessage::answer("SDP-B")]);
        assert_eq!(negotiation.state().phase(), Phase::AnswerSent);
        assert_eq!(negotiation.state().remote_description(), Some("SDP-A2"));
    }

    #[tokio::test]
    async fn successful_sequences_never_fail() {
        let peer = MockPeer::answering("SDP-B");
        let (mut negotiation, _) = negotiation(&peer);
        let script = [
            SignalMessage::candidate("c1"),
            SignalMessage::offer("SDP-A"),
            SignalMessage::candidate("c2"),
            SignalMessage::offer("SDP-A2"),
            SignalMessage::candidate("c3"),
        ];

        for message in &script {
            negotiation.dispatch(message).await.unwrap();
            assert_ne!(negotiation.state().phase(), Phase::Failed);
        }
        assert_eq!(peer.candidates(), vec!["c1", "c2", "c3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_deadline_tracks_unsettled_negotiation() {
        let timeout = Duration::from_secs(30);
        let peer = MockPeer::silent();
        let (mut negotiation, _) = negotiation(&peer);
        assert_eq!(negotiation.stall_deadline(timeout), None);

        let started = Instant::now();
        negotiation
            .dispatch(&SignalMessage::candidate("c1"))
            .await
            .unwrap();
        assert_eq!(negotiation.stall_deadline(timeout), Some(started + timeout));

        tokio::time::advance(Duration::from_secs(5)).await;
        negotiation
            .dispatch(&SignalMessage::offer("SDP-A"))
            .await
            .unwrap();
        // still the same unsettled stretch
        assert_eq!(negotiation.stall_deadline(timeout), Some(started + timeout));

        negotiation.expire();
        assert_eq!(negotiation.state().phase(), Phase::Failed);
        assert_eq!(negotiation.stall_deadline(timeout), None);
    }

    #[tokio::test]
    async fn close_releases_media_peer() {
        let peer = MockPeer::silent();
        let (negotiation, _) = negotiation(&peer);
        negotiation.close().await;
        assert_eq!(peer.calls(), vec![Call::Close]);
    }
}
