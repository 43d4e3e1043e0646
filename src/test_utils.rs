use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use callcore::{PeerEvent, PeerSessionId, PeerTransport, SignalEnvelope};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::relay::SignalSink;

/// Polls `condition` until it holds, advancing (possibly paused) time in
/// small steps. Panics after ten seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Relay stand-in that records what the call layer sends.
pub struct RecordingSink {
    connected: AtomicBool,
    accept_limit: AtomicUsize,
    sent: Mutex<Vec<SignalEnvelope>>,
}

impl RecordingSink {
    pub fn connected() -> Self {
        Self {
            connected: AtomicBool::new(true),
            accept_limit: AtomicUsize::new(usize::MAX),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected() -> Self {
        let sink = Self::connected();
        sink.set_connected(false);
        sink
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Refuses every `try_send` once `n` envelopes have been accepted.
    pub fn refuse_after(&self, n: usize) {
        self.accept_limit.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl SignalSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: SignalEnvelope) {
        if self.is_connected() {
            self.sent.lock().unwrap().push(envelope);
        }
    }

    fn try_send(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope> {
        let mut sent = self.sent.lock().unwrap();
        if !self.is_connected() || sent.len() >= self.accept_limit.load(Ordering::SeqCst) {
            return Err(envelope);
        }
        sent.push(envelope);
        Ok(())
    }
}

/// Peer transport that records every call as `name[:argument]`.
#[derive(Default)]
pub struct MockPeer {
    calls: Mutex<Vec<String>>,
    fail_offer: AtomicBool,
    fail_answer: AtomicBool,
    fail_apply: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    session: AtomicU64,
}

impl MockPeer {
    pub const OFFER: &'static str = "local-offer";
    pub const ANSWER: &'static str = "local-answer";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    pub fn fail_answer(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    pub fn fail_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().unwrap().insert(candidate.to_string());
    }

    /// The next offer or answer blocks until the returned sender fires.
    pub fn pause_next_negotiation(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Events as the current peer session would emit them.
    pub fn local_candidate(&self, candidate: &str) -> PeerEvent {
        PeerEvent::LocalIceCandidate {
            session: self.current_session(),
            candidate: candidate.to_string(),
        }
    }

    pub fn remote_media(&self) -> PeerEvent {
        PeerEvent::RemoteMediaAvailable {
            session: self.current_session(),
        }
    }

    pub fn connection_closed(&self) -> PeerEvent {
        PeerEvent::ConnectionClosed {
            session: self.current_session(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, name: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(':').next() == Some(name))
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix("ice:").map(str::to_string))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    fn current_session(&self) -> PeerSessionId {
        self.session.load(Ordering::SeqCst)
    }

    async fn create_offer(&self) -> Result<String, anyhow::Error> {
        self.record("create_offer".to_string());
        self.wait_gate().await;
        if self.fail_offer.load(Ordering::SeqCst) {
            anyhow::bail!("offer rejected");
        }
        Ok(Self::OFFER.to_string())
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String, anyhow::Error> {
        self.record(format!("create_answer:{remote_sdp}"));
        self.wait_gate().await;
        if self.fail_answer.load(Ordering::SeqCst) {
            anyhow::bail!("answer rejected");
        }
        Ok(Self::ANSWER.to_string())
    }

    async fn apply_answer(&self, remote_sdp: &str) -> Result<(), anyhow::Error> {
        self.record(format!("apply_answer:{remote_sdp}"));
        if self.fail_apply.load(Ordering::SeqCst) {
            anyhow::bail!("answer does not match offer");
        }
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: &str) -> Result<(), anyhow::Error> {
        if self.rejected.lock().unwrap().contains(candidate) {
            anyhow::bail!("malformed candidate");
        }
        self.record(format!("ice:{candidate}"));
        Ok(())
    }

    async fn close(&self) {
        self.record("close".to_string());
        self.session.fetch_add(1, Ordering::SeqCst);
    }
}
