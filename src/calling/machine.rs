//! Call state machine.
//!
//! [`Machine::apply`] maps `(state, trigger)` to `(next state, effects)`. It
//! never touches a resource: the controller executes the returned [`Effect`]s
//! in order and feeds the outcome of asynchronous ones back in as new
//! triggers. Invariant: `state != Idle` exactly when a session exists.

use super::peer::ConnectionState;
use super::signaling::{InboundSignal, OutboundSignal};
use super::{
    CallError, CallSession, CallState, CallType, IceCandidate, Notification, SessionDescription,
};

/// Why a local step of the call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    Media(String),
    Negotiation(String),
    Signaling(String),
}

impl CallFailure {
    fn user_message(&self, is_initiator: bool) -> String {
        match self {
            CallFailure::Media(detail) => {
                format!("Failed to access camera/microphone ({})", detail)
            }
            CallFailure::Negotiation(detail) if is_initiator => {
                format!("Failed to initiate call ({})", detail)
            }
            CallFailure::Negotiation(detail) => format!("Failed to accept call ({})", detail),
            CallFailure::Signaling(detail) => format!("Signaling failed ({})", detail),
        }
    }
}

/// Everything that can move the machine.
#[derive(Debug, Clone)]
pub enum Trigger {
    Initiate {
        participant_id: String,
        call_type: CallType,
    },
    Accept,
    Reject,
    End,
    Signal(InboundSignal),
    /// Local media was acquired and stored by the controller.
    MediaReady,
    LocalOfferReady(SessionDescription),
    LocalAnswerReady(SessionDescription),
    RemoteAnswerApplied,
    Connection(ConnectionState),
    LocalCandidate(IceCandidate),
    Failed(CallFailure),
}

/// Which side of the offer/answer exchange to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Offer,
    Answer(SessionDescription),
}

/// Side effects, executed by the controller in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AcquireMedia(CallType),
    /// Create the peer connection, attach local tracks, negotiate.
    Negotiate(Negotiation),
    ApplyRemoteAnswer(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    Send(OutboundSignal),
    Notify(Notification),
    /// Release every resource; the controller then calls
    /// [`Machine::finish_teardown`].
    Teardown,
}

/// How far the offer/answer exchange has progressed for the current call.
#[derive(Debug, Default)]
struct Progress {
    /// Offer received with `call:incoming`, consumed when answering.
    remote_offer: Option<SessionDescription>,
    negotiating: bool,
    /// `call:initiate` or `call:accept` went out.
    local_sent: bool,
    remote_applied: bool,
    /// Local candidates gathered before the description was sent.
    pending_candidates: Vec<IceCandidate>,
}

#[derive(Debug)]
pub struct Machine {
    local_id: String,
    state: CallState,
    session: Option<CallSession>,
    progress: Progress,
}

impl Machine {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            state: CallState::Idle,
            session: None,
            progress: Progress::default(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Apply one trigger.
    ///
    /// Only user actions can fail, and a failed action leaves the machine
    /// untouched.
    pub fn apply(&mut self, trigger: Trigger) -> Result<Vec<Effect>, CallError> {
        match trigger {
            Trigger::Initiate {
                participant_id,
                call_type,
            } => {
                self.expect_state(CallState::Idle, "initiate a call")?;
                tracing::info!("Calling {} ({})", participant_id, call_type);
                self.session = Some(CallSession::new(participant_id, true, call_type));
                self.progress = Progress::default();
                self.state = CallState::Calling;
                Ok(vec![Effect::AcquireMedia(call_type)])
            }
            Trigger::Accept => {
                self.expect_state(CallState::Incoming, "accept a call")?;
                let call_type = self.session_or("accept a call")?.call_type;
                self.state = CallState::Connected;
                Ok(vec![Effect::AcquireMedia(call_type)])
            }
            Trigger::Reject => {
                self.expect_state(CallState::Incoming, "reject a call")?;
                let to = self.session_or("reject a call")?.participant_id.clone();
                self.state = CallState::Ending;
                Ok(vec![
                    Effect::Send(OutboundSignal::Reject {
                        to,
                        from: self.local_id.clone(),
                    }),
                    Effect::Teardown,
                ])
            }
            Trigger::End => {
                let Some(session) = &self.session else {
                    return Ok(Vec::new());
                };
                let to = session.participant_id.clone();
                self.state = CallState::Ending;
                Ok(vec![
                    Effect::Send(OutboundSignal::End {
                        to,
                        from: self.local_id.clone(),
                    }),
                    Effect::Teardown,
                ])
            }
            Trigger::Signal(signal) => Ok(self.on_signal(signal)),
            Trigger::MediaReady => Ok(self.on_media_ready()),
            Trigger::LocalOfferReady(offer) => Ok(self.on_local_offer(offer)),
            Trigger::LocalAnswerReady(answer) => Ok(self.on_local_answer(answer)),
            Trigger::RemoteAnswerApplied => {
                if self.session.as_ref().is_some_and(|s| s.is_initiator) {
                    self.progress.remote_applied = true;
                    if self.state == CallState::Calling {
                        self.state = CallState::Connected;
                    }
                }
                Ok(Vec::new())
            }
            Trigger::Connection(state) => Ok(self.on_connection(state)),
            Trigger::LocalCandidate(candidate) => Ok(self.on_local_candidate(candidate)),
            Trigger::Failed(failure) => Ok(self.fail(failure)),
        }
    }

    /// Resources are released: forget the call.
    pub fn finish_teardown(&mut self) {
        self.state = CallState::Idle;
        self.session = None;
        self.progress = Progress::default();
    }

    fn expect_state(&self, expected: CallState, action: &'static str) -> Result<(), CallError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CallError::InvalidState {
                action,
                state: self.state,
            })
        }
    }

    fn session_or(&self, action: &'static str) -> Result<&CallSession, CallError> {
        self.session.as_ref().ok_or(CallError::InvalidState {
            action,
            state: self.state,
        })
    }

    fn participant(&self) -> String {
        self.session
            .as_ref()
            .map(|s| s.participant_id.clone())
            .unwrap_or_default()
    }

    fn duration_secs(&self) -> i64 {
        self.session.as_ref().map_or(0, CallSession::elapsed_secs)
    }

    /// Whether a signal about the current call should be processed.
    fn accepts(&self, signal: &InboundSignal) -> bool {
        let Some(session) = &self.session else {
            tracing::debug!("Dropping {} signal: no call in progress", signal.kind());
            return false;
        };
        match signal.from() {
            Some(from) if from != session.participant_id => {
                tracing::debug!(
                    "Dropping {} signal from {}: current call is with {}",
                    signal.kind(),
                    from,
                    session.participant_id
                );
                false
            }
            _ => true,
        }
    }

    fn on_signal(&mut self, signal: InboundSignal) -> Vec<Effect> {
        let incoming = matches!(signal, InboundSignal::Incoming { .. });
        if !incoming && !self.accepts(&signal) {
            return Vec::new();
        }
        match signal {
            InboundSignal::Incoming {
                from,
                offer,
                call_type,
            } => {
                if !self.state.is_idle() {
                    tracing::info!(
                        "Rejecting {} call from {}: already {}",
                        call_type,
                        from,
                        self.state
                    );
                    return vec![Effect::Send(OutboundSignal::Reject {
                        to: from,
                        from: self.local_id.clone(),
                    })];
                }
                tracing::info!("Incoming {} call from {}", call_type, from);
                self.session = Some(CallSession::new(from.clone(), false, call_type));
                self.progress = Progress {
                    remote_offer: Some(offer),
                    ..Progress::default()
                };
                self.state = CallState::Incoming;
                vec![Effect::Notify(Notification::IncomingCall { from, call_type })]
            }
            InboundSignal::Accepted { answer, .. } => {
                if self.state == CallState::Calling && self.progress.local_sent {
                    vec![Effect::ApplyRemoteAnswer(answer)]
                } else {
                    tracing::debug!("Dropping accepted signal in state {}", self.state);
                    Vec::new()
                }
            }
            InboundSignal::Rejected { .. } => {
                tracing::info!("Call rejected by {}", self.participant());
                self.state = CallState::Ending;
                vec![Effect::Notify(Notification::CallRejected), Effect::Teardown]
            }
            InboundSignal::Ended { .. } => {
                tracing::info!("Call ended by {}", self.participant());
                let duration_secs = self.duration_secs();
                self.state = CallState::Ending;
                vec![
                    Effect::Notify(Notification::CallEnded { duration_secs }),
                    Effect::Teardown,
                ]
            }
            InboundSignal::IceCandidate { candidate, .. } => match candidate {
                Some(c) if self.progress.remote_applied => vec![Effect::AddRemoteCandidate(c)],
                Some(_) => {
                    tracing::debug!("Dropping remote ICE candidate: no remote description yet");
                    Vec::new()
                }
                None => Vec::new(),
            },
        }
    }

    fn on_media_ready(&mut self) -> Vec<Effect> {
        if self.progress.negotiating {
            return Vec::new();
        }
        let is_initiator = match &self.session {
            Some(s) => s.is_initiator,
            None => return Vec::new(),
        };
        match self.state {
            CallState::Calling if is_initiator => {
                self.progress.negotiating = true;
                vec![Effect::Negotiate(Negotiation::Offer)]
            }
            CallState::Connected if !is_initiator => match self.progress.remote_offer.take() {
                Some(offer) => {
                    self.progress.negotiating = true;
                    vec![Effect::Negotiate(Negotiation::Answer(offer))]
                }
                None => self.fail(CallFailure::Negotiation("no remote offer".into())),
            },
            _ => Vec::new(),
        }
    }

    fn on_local_offer(&mut self, offer: SessionDescription) -> Vec<Effect> {
        let call_type = match &self.session {
            Some(s) if s.is_initiator && self.state == CallState::Calling => s.call_type,
            _ => return Vec::new(),
        };
        if self.progress.local_sent {
            return Vec::new();
        }
        self.progress.local_sent = true;
        let mut effects = vec![Effect::Send(OutboundSignal::Initiate {
            to: self.participant(),
            from: self.local_id.clone(),
            offer,
            call_type,
        })];
        effects.extend(self.flush_candidates());
        effects
    }

    fn on_local_answer(&mut self, answer: SessionDescription) -> Vec<Effect> {
        match &self.session {
            Some(s) if !s.is_initiator && self.state == CallState::Connected => {}
            _ => return Vec::new(),
        }
        if self.progress.local_sent {
            return Vec::new();
        }
        // The answer is only produced after the remote offer was applied.
        self.progress.remote_applied = true;
        self.progress.local_sent = true;
        let mut effects = vec![Effect::Send(OutboundSignal::Accept {
            to: self.participant(),
            from: self.local_id.clone(),
            answer,
        })];
        effects.extend(self.flush_candidates());
        effects
    }

    fn flush_candidates(&mut self) -> Vec<Effect> {
        let to = self.participant();
        self.progress
            .pending_candidates
            .drain(..)
            .map(|candidate| {
                Effect::Send(OutboundSignal::IceCandidate {
                    to: to.clone(),
                    candidate,
                })
            })
            .collect()
    }

    fn on_connection(&mut self, state: ConnectionState) -> Vec<Effect> {
        if state == ConnectionState::Connected {
            if matches!(self.state, CallState::Calling | CallState::Incoming) {
                tracing::info!("Peer connection established, call connected");
                self.state = CallState::Connected;
            }
            return Vec::new();
        }
        if state.is_lost() && self.session.is_some() {
            tracing::warn!("Peer connection {:?}, ending call", state);
            let duration_secs = self.duration_secs();
            self.state = CallState::Ending;
            return vec![
                Effect::Notify(Notification::CallEnded { duration_secs }),
                Effect::Teardown,
            ];
        }
        Vec::new()
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<Effect> {
        if self.session.is_none() {
            return Vec::new();
        }
        if self.progress.local_sent {
            vec![Effect::Send(OutboundSignal::IceCandidate {
                to: self.participant(),
                candidate,
            })]
        } else {
            self.progress.pending_candidates.push(candidate);
            Vec::new()
        }
    }

    fn fail(&mut self, failure: CallFailure) -> Vec<Effect> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        tracing::warn!("Call with {} failed: {:?}", session.participant_id, failure);
        let message = failure.user_message(session.is_initiator);
        // The far side only knows about the call once it offered or received
        // our offer.
        let remote_aware = !session.is_initiator || self.progress.local_sent;

        let mut effects = Vec::new();
        if remote_aware && !matches!(failure, CallFailure::Signaling(_)) {
            effects.push(Effect::Send(OutboundSignal::End {
                to: session.participant_id.clone(),
                from: self.local_id.clone(),
            }));
        }
        effects.push(Effect::Notify(Notification::Failed { message }));
        effects.push(Effect::Teardown);
        self.state = CallState::Ending;
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: &str = "me";

    fn incoming(from: &str, call_type: CallType) -> Trigger {
        Trigger::Signal(InboundSignal::Incoming {
            from: from.into(),
            offer: SessionDescription::offer("remote-offer"),
            call_type,
        })
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 UDP 2130706431 10.0.0.1 5000 typ host", n),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Apply a trigger the way the controller does: teardown completes in
    /// the same step.
    fn drive(m: &mut Machine, trigger: Trigger) -> Vec<Effect> {
        let effects = m.apply(trigger).unwrap();
        if effects.contains(&Effect::Teardown) {
            m.finish_teardown();
        }
        assert_eq!(
            m.state() != CallState::Idle,
            m.session().is_some(),
            "state/session diverged in {}",
            m.state()
        );
        effects
    }

    fn sent(effects: &[Effect]) -> Vec<&OutboundSignal> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// Caller side up to `call:initiate` sent.
    fn calling(m: &mut Machine, participant: &str) {
        drive(
            m,
            Trigger::Initiate {
                participant_id: participant.into(),
                call_type: CallType::Video,
            },
        );
        drive(m, Trigger::MediaReady);
        drive(m, Trigger::LocalOfferReady(SessionDescription::offer("local-offer")));
    }

    #[test]
    fn test_initiate_from_idle() {
        let mut m = Machine::new(ME);
        let effects = drive(
            &mut m,
            Trigger::Initiate {
                participant_id: "p".into(),
                call_type: CallType::Video,
            },
        );
        assert_eq!(effects, vec![Effect::AcquireMedia(CallType::Video)]);
        assert_eq!(m.state(), CallState::Calling);
        let session = m.session().unwrap();
        assert!(session.is_initiator);
        assert_eq!(session.participant_id, "p");
    }

    #[test]
    fn test_initiate_twice_fails_without_mutation() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let err = m
            .apply(Trigger::Initiate {
                participant_id: "other".into(),
                call_type: CallType::Audio,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidState {
                state: CallState::Calling,
                ..
            }
        ));
        assert_eq!(m.session().unwrap().participant_id, "p");
    }

    #[test]
    fn test_accept_and_reject_require_incoming() {
        let mut m = Machine::new(ME);
        assert!(m.apply(Trigger::Accept).is_err());
        assert!(m.apply(Trigger::Reject).is_err());
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_caller_flow() {
        let mut m = Machine::new(ME);
        drive(
            &mut m,
            Trigger::Initiate {
                participant_id: "p".into(),
                call_type: CallType::Video,
            },
        );
        assert_eq!(
            drive(&mut m, Trigger::MediaReady),
            vec![Effect::Negotiate(Negotiation::Offer)]
        );
        // A second media completion must not start another negotiation.
        assert!(drive(&mut m, Trigger::MediaReady).is_empty());

        let effects = drive(&mut m, Trigger::LocalOfferReady(SessionDescription::offer("o")));
        assert_eq!(
            sent(&effects),
            vec![&OutboundSignal::Initiate {
                to: "p".into(),
                from: ME.into(),
                offer: SessionDescription::offer("o"),
                call_type: CallType::Video,
            }]
        );

        let effects = drive(
            &mut m,
            Trigger::Signal(InboundSignal::Accepted {
                from: Some("p".into()),
                answer: SessionDescription::answer("a"),
            }),
        );
        assert_eq!(
            effects,
            vec![Effect::ApplyRemoteAnswer(SessionDescription::answer("a"))]
        );
        assert_eq!(m.state(), CallState::Calling);

        drive(&mut m, Trigger::RemoteAnswerApplied);
        assert_eq!(m.state(), CallState::Connected);

        let effects = drive(&mut m, Trigger::End);
        assert_eq!(
            sent(&effects),
            vec![&OutboundSignal::End {
                to: "p".into(),
                from: ME.into()
            }]
        );
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_accepted_before_offer_sent_is_dropped() {
        let mut m = Machine::new(ME);
        drive(
            &mut m,
            Trigger::Initiate {
                participant_id: "p".into(),
                call_type: CallType::Audio,
            },
        );
        let effects = drive(
            &mut m,
            Trigger::Signal(InboundSignal::Accepted {
                from: None,
                answer: SessionDescription::answer("a"),
            }),
        );
        assert!(effects.is_empty());
        assert_eq!(m.state(), CallState::Calling);
    }

    #[test]
    fn test_callee_flow() {
        let mut m = Machine::new(ME);
        let effects = drive(&mut m, incoming("q", CallType::Audio));
        assert_eq!(
            effects,
            vec![Effect::Notify(Notification::IncomingCall {
                from: "q".into(),
                call_type: CallType::Audio
            })]
        );
        assert_eq!(m.state(), CallState::Incoming);
        assert!(!m.session().unwrap().is_initiator);

        assert_eq!(
            drive(&mut m, Trigger::Accept),
            vec![Effect::AcquireMedia(CallType::Audio)]
        );
        assert_eq!(m.state(), CallState::Connected);

        assert_eq!(
            drive(&mut m, Trigger::MediaReady),
            vec![Effect::Negotiate(Negotiation::Answer(
                SessionDescription::offer("remote-offer")
            ))]
        );

        let effects = drive(&mut m, Trigger::LocalAnswerReady(SessionDescription::answer("a")));
        assert_eq!(
            sent(&effects),
            vec![&OutboundSignal::Accept {
                to: "q".into(),
                from: ME.into(),
                answer: SessionDescription::answer("a"),
            }]
        );

        // Remote description is in place, so candidates now flow through.
        let effects = drive(
            &mut m,
            Trigger::Signal(InboundSignal::IceCandidate {
                from: Some("q".into()),
                candidate: Some(candidate(1)),
            }),
        );
        assert_eq!(effects, vec![Effect::AddRemoteCandidate(candidate(1))]);
    }

    #[test]
    fn test_reject_incoming() {
        let mut m = Machine::new(ME);
        drive(&mut m, incoming("q", CallType::Audio));
        let effects = drive(&mut m, Trigger::Reject);
        assert_eq!(
            effects,
            vec![
                Effect::Send(OutboundSignal::Reject {
                    to: "q".into(),
                    from: ME.into()
                }),
                Effect::Teardown
            ]
        );
        assert_eq!(m.state(), CallState::Idle);
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::AcquireMedia(_))));
    }

    #[test]
    fn test_busy_reject_while_calling() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let effects = drive(&mut m, incoming("q", CallType::Video));
        assert_eq!(
            effects,
            vec![Effect::Send(OutboundSignal::Reject {
                to: "q".into(),
                from: ME.into()
            })]
        );
        assert_eq!(m.state(), CallState::Calling);
        assert_eq!(m.session().unwrap().participant_id, "p");
    }

    #[test]
    fn test_busy_reject_while_incoming() {
        let mut m = Machine::new(ME);
        drive(&mut m, incoming("q", CallType::Video));
        let effects = drive(&mut m, incoming("r", CallType::Audio));
        assert_eq!(sent(&effects).len(), 1);
        assert_eq!(sent(&effects)[0].to(), "r");
        assert_eq!(m.state(), CallState::Incoming);
        assert_eq!(m.session().unwrap().participant_id, "q");
    }

    #[test]
    fn test_end_when_idle_is_noop() {
        let mut m = Machine::new(ME);
        assert!(drive(&mut m, Trigger::End).is_empty());
        assert!(drive(&mut m, Trigger::End).is_empty());
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_remote_end_does_not_signal_back() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let effects = drive(&mut m, Trigger::Signal(InboundSignal::Ended { from: None }));
        assert!(sent(&effects).is_empty());
        assert!(matches!(
            effects[0],
            Effect::Notify(Notification::CallEnded { .. })
        ));
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_remote_reject_tears_down() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let effects = drive(&mut m, Trigger::Signal(InboundSignal::Rejected { from: None }));
        assert_eq!(
            effects,
            vec![Effect::Notify(Notification::CallRejected), Effect::Teardown]
        );
    }

    #[test]
    fn test_signal_from_other_party_is_dropped() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let effects = drive(
            &mut m,
            Trigger::Signal(InboundSignal::Ended {
                from: Some("stranger".into()),
            }),
        );
        assert!(effects.is_empty());
        assert_eq!(m.state(), CallState::Calling);
    }

    #[test]
    fn test_signals_while_idle_are_dropped() {
        let mut m = Machine::new(ME);
        for signal in [
            InboundSignal::Rejected { from: None },
            InboundSignal::Ended { from: None },
            InboundSignal::Accepted {
                from: None,
                answer: SessionDescription::answer("a"),
            },
            InboundSignal::IceCandidate {
                from: None,
                candidate: Some(candidate(1)),
            },
        ] {
            assert!(drive(&mut m, Trigger::Signal(signal)).is_empty());
        }
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_remote_candidate_before_answer_is_dropped() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let effects = drive(
            &mut m,
            Trigger::Signal(InboundSignal::IceCandidate {
                from: Some("p".into()),
                candidate: Some(candidate(1)),
            }),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_local_candidates_wait_for_offer() {
        let mut m = Machine::new(ME);
        drive(
            &mut m,
            Trigger::Initiate {
                participant_id: "p".into(),
                call_type: CallType::Audio,
            },
        );
        drive(&mut m, Trigger::MediaReady);
        assert!(drive(&mut m, Trigger::LocalCandidate(candidate(1))).is_empty());
        assert!(drive(&mut m, Trigger::LocalCandidate(candidate(2))).is_empty());

        let effects = drive(&mut m, Trigger::LocalOfferReady(SessionDescription::offer("o")));
        let names: Vec<_> = sent(&effects).iter().map(|s| s.event_name()).collect();
        assert_eq!(
            names,
            vec!["call:initiate", "call:ice-candidate", "call:ice-candidate"]
        );

        let effects = drive(&mut m, Trigger::LocalCandidate(candidate(3)));
        assert_eq!(
            effects,
            vec![Effect::Send(OutboundSignal::IceCandidate {
                to: "p".into(),
                candidate: candidate(3)
            })]
        );
    }

    #[test]
    fn test_connection_lost_tears_down_silently() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        drive(&mut m, Trigger::Connection(ConnectionState::Connected));
        assert_eq!(m.state(), CallState::Connected);

        let effects = drive(&mut m, Trigger::Connection(ConnectionState::Failed));
        assert!(sent(&effects).is_empty());
        assert!(effects.contains(&Effect::Teardown));
        assert_eq!(m.state(), CallState::Idle);

        // Closing the old connection reports nothing actionable.
        assert!(drive(&mut m, Trigger::Connection(ConnectionState::Disconnected)).is_empty());
    }

    #[test]
    fn test_caller_media_failure_before_offer_does_not_signal() {
        let mut m = Machine::new(ME);
        drive(
            &mut m,
            Trigger::Initiate {
                participant_id: "p".into(),
                call_type: CallType::Video,
            },
        );
        let effects = drive(
            &mut m,
            Trigger::Failed(CallFailure::Media("permission denied".into())),
        );
        assert!(sent(&effects).is_empty());
        assert_eq!(
            effects[0],
            Effect::Notify(Notification::Failed {
                message: "Failed to access camera/microphone (permission denied)".into()
            })
        );
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_callee_failure_tells_caller() {
        let mut m = Machine::new(ME);
        drive(&mut m, incoming("q", CallType::Video));
        drive(&mut m, Trigger::Accept);
        let effects = drive(&mut m, Trigger::Failed(CallFailure::Negotiation("bad sdp".into())));
        assert_eq!(
            sent(&effects),
            vec![&OutboundSignal::End {
                to: "q".into(),
                from: ME.into()
            }]
        );
        assert!(effects.contains(&Effect::Notify(Notification::Failed {
            message: "Failed to accept call (bad sdp)".into()
        })));
    }

    #[test]
    fn test_signaling_failure_does_not_resend() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        let effects = drive(&mut m, Trigger::Failed(CallFailure::Signaling("closed".into())));
        assert!(sent(&effects).is_empty());
        assert_eq!(m.state(), CallState::Idle);
    }

    #[test]
    fn test_failure_when_idle_is_ignored() {
        let mut m = Machine::new(ME);
        assert!(drive(&mut m, Trigger::Failed(CallFailure::Media("late".into()))).is_empty());
    }

    #[test]
    fn test_new_call_after_teardown_starts_clean() {
        let mut m = Machine::new(ME);
        calling(&mut m, "p");
        drive(&mut m, Trigger::End);
        drive(&mut m, incoming("q", CallType::Audio));
        drive(&mut m, Trigger::Accept);
        // No leftover progress from the previous call.
        assert_eq!(
            drive(&mut m, Trigger::MediaReady),
            vec![Effect::Negotiate(Negotiation::Answer(
                SessionDescription::offer("remote-offer")
            ))]
        );
    }
}
