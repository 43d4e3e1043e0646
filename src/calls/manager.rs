//! Call manager for orchestrating call lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use callcore::{
    CallSession, CallState, CallTransition, ConnectionState, CoreEventBus, EndReason, ErrorKind,
    ErrorNotice, Event, ParticipantId, PeerEvent, PeerTransport, SignalEnvelope,
};
use log::{debug, info, warn};

use super::error::CallError;
use super::negotiation::NegotiationCoordinator;
use crate::relay::SignalSink;

/// Owns the one call session of the process.
///
/// The session sits behind a mutex that is never held across an await.
/// Every operation that suspends (offer, answer, release) records the
/// session generation and expected state first and re-checks both when it
/// resumes; a mismatch means the call moved on and the result is discarded.
pub struct CallManager {
    session: Mutex<CallSession>,
    local_id: RwLock<Option<ParticipantId>>,
    signals: Arc<dyn SignalSink>,
    negotiation: NegotiationCoordinator,
    event_bus: CoreEventBus,
}

impl CallManager {
    pub fn new(
        signals: Arc<dyn SignalSink>,
        peer: Arc<dyn PeerTransport>,
        event_bus: CoreEventBus,
    ) -> Self {
        Self {
            session: Mutex::new(CallSession::new()),
            local_id: RwLock::new(None),
            negotiation: NegotiationCoordinator::new(peer, signals.clone(), event_bus.clone()),
            signals,
            event_bus,
        }
    }

    pub fn set_local_id(&self, id: ParticipantId) {
        *self.local_id.write().expect("RwLock should not be poisoned") = Some(id);
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id
            .read()
            .expect("RwLock should not be poisoned")
            .clone()
    }

    pub fn state(&self) -> CallState {
        self.lock().state.clone()
    }

    /// Candidates gathered locally that have not reached the relay yet.
    pub fn pending_local_candidates(&self) -> usize {
        self.lock().pending_local_ice.len()
    }

    fn lock(&self) -> MutexGuard<'_, CallSession> {
        self.session.lock().expect("Mutex should not be poisoned")
    }

    // ---- local commands ----

    /// Places a call to `remote`.
    ///
    /// Sends the call request and any queued local candidates, then creates
    /// and sends the offer. A negotiation failure ends the call and is
    /// returned to the caller.
    pub async fn call_user(&self, remote: ParticipantId) -> Result<(), CallError> {
        let local = self.local_id().ok_or(CallError::NotConnected)?;
        if !self.signals.is_connected() {
            return Err(CallError::NotConnected);
        }

        let generation = {
            let mut session = self.lock();
            if let Some(current) = session.remote() {
                return Err(CallError::Busy {
                    remote: current.clone(),
                });
            }
            session.apply_transition(CallTransition::Dial {
                remote: remote.clone(),
            })?;
            self.signals.send(SignalEnvelope::CallRequest {
                from: local.clone(),
                to: remote.clone(),
            });
            self.negotiation.flush_local_ice(&mut session, &local);
            session.generation
        };
        info!(target: "Call", "Calling {remote}");

        let expected = CallState::Outgoing(remote.clone());
        match self.negotiation.create_offer().await {
            Ok(sdp) => {
                let current = {
                    let session = self.lock();
                    let current = session.is_current(generation, &expected);
                    if current {
                        self.signals.send(SignalEnvelope::Offer {
                            from: local,
                            to: remote.clone(),
                            sdp,
                        });
                    }
                    current
                };
                if current {
                    debug!(target: "Call/Negotiation", "Offer sent to {remote}");
                    Ok(())
                } else {
                    self.discard_stale("offer", &remote).await;
                    Err(CallError::Superseded)
                }
            }
            Err(e) => {
                warn!(target: "Call/Negotiation", "Failed to create offer for {remote}: {e}");
                self.report_negotiation_error(format!("failed to create offer: {e}"));
                self.terminate(Some(generation), EndReason::NegotiationFailed, true)
                    .await;
                Err(CallError::Negotiation(e.to_string()))
            }
        }
    }

    /// Accepts the ringing call. If the caller's offer already arrived it
    /// is answered before this returns.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (generation, remote, held_offer) = {
            let mut session = self.lock();
            let remote = match &session.state {
                CallState::Ringing(remote) => remote.clone(),
                _ => return Err(CallError::NoIncomingCall),
            };
            session.apply_transition(CallTransition::LocalAccepted)?;
            (session.generation, remote, session.held_offer.take())
        };
        info!(target: "Call", "Accepted call from {remote}");

        match held_offer {
            Some(sdp) => self.answer_offer(generation, remote, sdp).await,
            None => Ok(()),
        }
    }

    /// Declines the ringing call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let generation = {
            let session = self.lock();
            if !session.state.is_ringing() {
                return Err(CallError::NoIncomingCall);
            }
            session.generation
        };
        self.terminate(Some(generation), EndReason::Rejected, true)
            .await;
        Ok(())
    }

    /// Hangs up or cancels the current call. A no-op when there is none.
    pub async fn end_call(&self) {
        if !self.terminate(None, EndReason::LocalHangup, true).await {
            debug!(target: "Call", "end_call with no call in progress");
        }
    }

    // ---- inbound ----

    pub async fn handle_signal(&self, envelope: SignalEnvelope) {
        let local = self.local_id();
        if let (Some(local), Some(to)) = (local.as_ref(), envelope.recipient())
            && to != local
        {
            warn!(target: "Call", "Ignoring `{}` addressed to {to}", envelope.kind());
            return;
        }

        match envelope {
            SignalEnvelope::Register { .. } => {
                debug!(target: "Call", "Ignoring register echoed by relay");
            }
            SignalEnvelope::CallRequest { from, .. } => self.handle_call_request(from),
            SignalEnvelope::Offer { from, sdp, .. } => self.handle_offer(from, sdp).await,
            SignalEnvelope::Answer { from, sdp, .. } => self.handle_answer(from, sdp).await,
            SignalEnvelope::IceCandidate {
                from, candidate, ..
            } => self.handle_remote_candidate(from, candidate).await,
            SignalEnvelope::EndCall { from, .. } => self.handle_end(from).await,
        }
    }

    fn handle_call_request(&self, from: ParticipantId) {
        {
            let mut session = self.lock();
            if !session.state.is_idle() {
                info!(
                    target: "Call",
                    "Ignoring call from {from}: already {} with {}",
                    session.state.name(),
                    session.remote().map(|r| r.as_str()).unwrap_or_default()
                );
                return;
            }
            if let Err(e) = session.apply_transition(CallTransition::IncomingCall {
                from: from.clone(),
            }) {
                warn!(target: "Call", "Cannot ring for {from}: {e}");
                return;
            }
        }
        info!(target: "Call", "Incoming call from {from}");
        self.event_bus.dispatch(&Event::IncomingCall { from });
    }

    async fn handle_offer(&self, from: ParticipantId, sdp: String) {
        let generation = {
            let mut session = self.lock();
            match session.state.clone() {
                CallState::Ringing(remote) if remote == from => {
                    debug!(target: "Call/Negotiation", "Holding offer from {from} until accepted");
                    session.held_offer = Some(sdp);
                    return;
                }
                CallState::Negotiating(remote)
                    if remote == from && !session.remote_description_applied =>
                {
                    session.generation
                }
                state => {
                    debug!(
                        target: "Call",
                        "Ignoring offer from {from} in state {}",
                        state.name()
                    );
                    return;
                }
            }
        };

        if let Err(e) = self.answer_offer(generation, from, sdp).await {
            warn!(target: "Call/Negotiation", "Could not answer offer: {e}");
        }
    }

    async fn handle_answer(&self, from: ParticipantId, sdp: String) {
        let generation = {
            let session = self.lock();
            match &session.state {
                CallState::Outgoing(remote)
                    if *remote == from && !session.remote_description_applied =>
                {
                    session.generation
                }
                state => {
                    debug!(
                        target: "Call",
                        "Ignoring answer from {from} in state {}",
                        state.name()
                    );
                    return;
                }
            }
        };

        let expected = CallState::Outgoing(from.clone());
        if let Err(e) = self.negotiation.apply_answer(&sdp).await {
            warn!(target: "Call/Negotiation", "Failed to apply answer from {from}: {e}");
            self.report_negotiation_error(format!("failed to apply answer: {e}"));
            self.terminate(Some(generation), EndReason::NegotiationFailed, true)
                .await;
            return;
        }

        let pending = {
            let mut session = self.lock();
            if !session.is_current(generation, &expected) {
                None
            } else {
                session.remote_description_applied = true;
                match session.apply_transition(CallTransition::AnswerApplied) {
                    Ok(()) => Some(std::mem::take(&mut session.pending_remote_ice)),
                    Err(e) => {
                        warn!(target: "Call", "{e}");
                        None
                    }
                }
            }
        };

        match pending {
            Some(pending) => {
                info!(target: "Call", "Call with {from} is active");
                self.event_bus.dispatch(&Event::CallActive {
                    remote: from.clone(),
                });
                self.negotiation
                    .apply_remote_candidates(&from, pending)
                    .await;
            }
            None => self.discard_stale("answer", &from).await,
        }
    }

    async fn handle_remote_candidate(&self, from: ParticipantId, candidate: String) {
        let apply_now = {
            let mut session = self.lock();
            if session.state.live_remote() != Some(&from) {
                debug!(
                    target: "Call",
                    "Ignoring candidate from {from} in state {}",
                    session.state.name()
                );
                return;
            }
            if session.remote_description_applied {
                true
            } else {
                session.pending_remote_ice.push(candidate.clone());
                false
            }
        };

        if apply_now {
            self.negotiation
                .apply_remote_candidates(&from, vec![candidate])
                .await;
        } else {
            debug!(target: "Call/Negotiation", "Buffered candidate from {from}");
        }
    }

    async fn handle_end(&self, from: ParticipantId) {
        let generation = {
            let session = self.lock();
            if session.state.live_remote() != Some(&from) {
                debug!(
                    target: "Call",
                    "Ignoring end from {from} in state {}",
                    session.state.name()
                );
                return;
            }
            session.generation
        };
        self.terminate(Some(generation), EndReason::RemoteHangup, false)
            .await;
    }

    // ---- peer and relay events ----

    /// Events from a peer session that has since been released are dropped,
    /// so a late failure of the previous connection never ends the next call.
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let current = self.negotiation.current_session();
        if event.session() != current {
            debug!(
                target: "Call",
                "Ignoring {event:?} from released peer session (current {current})"
            );
            return;
        }

        match event {
            PeerEvent::LocalIceCandidate { candidate, .. } => {
                let local = self.local_id();
                let mut session = self.lock();
                session.pending_local_ice.push_back(candidate);
                if let Some(local) = local {
                    self.negotiation.flush_local_ice(&mut session, &local);
                }
            }
            PeerEvent::RemoteMediaAvailable { .. } => {
                let remote = self.lock().remote().cloned();
                debug!(target: "Call", "Remote media available");
                self.event_bus.dispatch(&Event::RemoteMedia { remote });
            }
            PeerEvent::ConnectionClosed { .. } => {
                if self.terminate(None, EndReason::PeerFailure, true).await {
                    warn!(target: "Call", "Peer connection failed, call ended");
                } else {
                    debug!(target: "Call", "Peer connection closed with no call in progress");
                }
            }
        }
    }

    /// Relay state changes. Losing the relay never ends a call; regaining it
    /// flushes whatever candidates queued up meanwhile.
    pub fn handle_connection_state(&self, state: ConnectionState) {
        if !state.is_connected() {
            return;
        }
        if let Some(local) = self.local_id() {
            let mut session = self.lock();
            self.negotiation.flush_local_ice(&mut session, &local);
        }
    }

    /// Takes back an envelope the relay accepted but could not write.
    /// Candidates for the live remote are queued again ahead of newer ones
    /// and leave with the next flush; anything else is gone.
    pub fn handle_undelivered(&self, envelope: SignalEnvelope) {
        let (to, candidate) = match envelope {
            SignalEnvelope::IceCandidate { to, candidate, .. } => (to, candidate),
            other => {
                debug!(target: "Call", "Lost `{}` message is not resent", other.kind());
                return;
            }
        };
        let mut session = self.lock();
        if session.state.live_remote() == Some(&to) {
            session.return_local_candidate(candidate);
            debug!(
                target: "Call/Negotiation",
                "Requeued undelivered candidate for {to}, {} queued",
                session.pending_local_ice.len()
            );
        } else {
            debug!(target: "Call/Negotiation", "Discarding undelivered candidate for {to}");
        }
    }

    // ---- helpers ----

    async fn answer_offer(
        &self,
        generation: u64,
        remote: ParticipantId,
        sdp: String,
    ) -> Result<(), CallError> {
        let local = self.local_id().ok_or(CallError::NotConnected)?;
        let expected = CallState::Negotiating(remote.clone());

        let answer = match self.negotiation.create_answer(&sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(target: "Call/Negotiation", "Failed to answer {remote}: {e}");
                self.report_negotiation_error(format!("failed to create answer: {e}"));
                self.terminate(Some(generation), EndReason::NegotiationFailed, true)
                    .await;
                return Err(CallError::Negotiation(e.to_string()));
            }
        };

        let pending = {
            let mut session = self.lock();
            if !session.is_current(generation, &expected) {
                None
            } else {
                self.signals.send(SignalEnvelope::Answer {
                    from: local.clone(),
                    to: remote.clone(),
                    sdp: answer,
                });
                session.remote_description_applied = true;
                session.apply_transition(CallTransition::AnswerSent)?;
                self.negotiation.flush_local_ice(&mut session, &local);
                Some(std::mem::take(&mut session.pending_remote_ice))
            }
        };

        let Some(pending) = pending else {
            self.discard_stale("answer", &remote).await;
            return Err(CallError::Superseded);
        };

        info!(target: "Call", "Call with {remote} is active");
        self.event_bus.dispatch(&Event::CallActive {
            remote: remote.clone(),
        });
        self.negotiation
            .apply_remote_candidates(&remote, pending)
            .await;
        Ok(())
    }

    /// Ends the current call: `Hangup`, optional EndCall to the remote, peer
    /// release, then `Released`. With `Some(generation)` only that call is
    /// ended. Returns false when there was nothing to end.
    async fn terminate(
        &self,
        generation: Option<u64>,
        reason: EndReason,
        notify_remote: bool,
    ) -> bool {
        let (remote, generation, duration_secs) = {
            let mut session = self.lock();
            if generation.is_some_and(|g| g != session.generation) {
                return false;
            }
            let Some(remote) = session.state.live_remote().cloned() else {
                return false;
            };
            let duration_secs = session.duration_secs();
            if let Err(e) = session.apply_transition(CallTransition::Hangup) {
                warn!(target: "Call", "{e}");
                return false;
            }
            if notify_remote && let Some(local) = self.local_id() {
                self.signals.send(SignalEnvelope::EndCall {
                    from: local,
                    to: remote.clone(),
                });
            }
            (remote, session.generation, duration_secs)
        };

        self.negotiation.release().await;

        {
            let mut session = self.lock();
            if session.is_current(generation, &CallState::Ending(remote.clone())) {
                if let Err(e) = session.apply_transition(CallTransition::Released) {
                    warn!(target: "Call", "{e}");
                }
            }
        }

        info!(target: "Call", "Call with {remote} ended ({reason:?})");
        self.event_bus.dispatch(&Event::CallEnded {
            remote,
            reason,
            duration_secs,
        });
        true
    }

    /// A suspended operation resumed after its call was gone. The peer work
    /// it did is thrown away; if nothing else is in progress the peer is
    /// released again so no half-built session lingers.
    async fn discard_stale(&self, what: &str, remote: &ParticipantId) {
        debug!(target: "Call/Negotiation", "Discarding stale {what} for {remote}");
        let idle = self.lock().state.is_idle();
        if idle {
            self.negotiation.release().await;
        }
    }

    fn report_negotiation_error(&self, message: String) {
        self.event_bus.dispatch(&Event::Error(ErrorNotice::new(
            ErrorKind::Negotiation,
            message,
        )));
    }
}
