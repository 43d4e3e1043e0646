use std::sync::Arc;

use callcore::{
    CallSession, CoreEventBus, ErrorKind, ErrorNotice, Event, ParticipantId, PeerSessionId,
    PeerTransport, SignalEnvelope,
};
use log::{debug, warn};

use crate::relay::SignalSink;

/// Bridges the call session and the peer transport.
///
/// Local candidates are queued on the session the moment they are gathered
/// and leave only through [`flush_local_ice`](Self::flush_local_ice), which
/// drains them front to back. Remote candidates are applied in the order
/// given.
pub struct NegotiationCoordinator {
    peer: Arc<dyn PeerTransport>,
    signals: Arc<dyn SignalSink>,
    event_bus: CoreEventBus,
}

impl NegotiationCoordinator {
    pub fn new(
        peer: Arc<dyn PeerTransport>,
        signals: Arc<dyn SignalSink>,
        event_bus: CoreEventBus,
    ) -> Self {
        Self {
            peer,
            signals,
            event_bus,
        }
    }

    pub async fn create_offer(&self) -> Result<String, anyhow::Error> {
        debug!(target: "Call/Negotiation", "Creating offer");
        self.peer.create_offer().await
    }

    pub async fn create_answer(&self, remote_sdp: &str) -> Result<String, anyhow::Error> {
        debug!(target: "Call/Negotiation", "Creating answer ({} byte offer)", remote_sdp.len());
        self.peer.create_answer(remote_sdp).await
    }

    pub async fn apply_answer(&self, remote_sdp: &str) -> Result<(), anyhow::Error> {
        debug!(target: "Call/Negotiation", "Applying answer ({} bytes)", remote_sdp.len());
        self.peer.apply_answer(remote_sdp).await
    }

    /// Applies remote candidates in order. A candidate the peer transport
    /// rejects is reported and skipped.
    pub async fn apply_remote_candidates(&self, from: &ParticipantId, candidates: Vec<String>) {
        if candidates.is_empty() {
            return;
        }
        debug!(
            target: "Call/Negotiation",
            "Applying {} remote candidates from {from}",
            candidates.len()
        );
        for candidate in candidates {
            if let Err(e) = self.peer.add_remote_ice_candidate(&candidate).await {
                warn!(target: "Call/Negotiation", "Candidate from {from} dropped: {e}");
                self.event_bus.dispatch(&Event::Error(ErrorNotice::new(
                    ErrorKind::Negotiation,
                    format!("candidate from {from} dropped: {e}"),
                )));
            }
        }
    }

    /// Sends queued local candidates to the live remote, oldest first.
    ///
    /// Does nothing until the call has a remote and the relay is connected.
    /// Stops at the first candidate the relay refuses and puts it back at
    /// the front of the queue.
    pub fn flush_local_ice(&self, session: &mut CallSession, local: &ParticipantId) {
        let Some(remote) = session.state.live_remote().cloned() else {
            return;
        };
        if session.pending_local_ice.is_empty() || !self.signals.is_connected() {
            return;
        }

        let mut flushed = 0usize;
        while let Some(candidate) = session.pending_local_ice.pop_front() {
            let envelope = SignalEnvelope::IceCandidate {
                from: local.clone(),
                to: remote.clone(),
                candidate,
            };
            if let Err(SignalEnvelope::IceCandidate { candidate, .. }) =
                self.signals.try_send(envelope)
            {
                session.pending_local_ice.push_front(candidate);
                break;
            }
            flushed += 1;
        }
        session.returned_local_ice = session.returned_local_ice.saturating_sub(flushed);

        debug!(
            target: "Call/Negotiation",
            "Flushed {flushed} local candidates to {remote}, {} still queued",
            session.pending_local_ice.len()
        );
    }

    /// The peer session whose events still describe a live connection.
    pub fn current_session(&self) -> PeerSessionId {
        self.peer.current_session()
    }

    /// Releases the peer session.
    pub async fn release(&self) {
        debug!(target: "Call/Negotiation", "Releasing peer session");
        self.peer.close().await;
    }
}
