use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use callcore::{
    ConnectionState, ReconnectPolicy, SignalEnvelope, Transport, TransportEvent,
    TransportFactory,
};
use log::{debug, error, info, trace, warn};
use tokio::sync::{Notify, mpsc, watch};

use super::SignalSink;
use super::error::{ConnectError, TransportError};
use super::handlers::{ErrorHandler, MessageHandler, Registry, StateHandler, Subscription};
use crate::config::ClientConfig;

/// The single logical connection to the signaling relay.
///
/// Owns the connection lifecycle: connect coalescing, delivery of decoded
/// envelopes to subscribers, an ordered outbound queue and the automatic
/// reconnect schedule. Every `connect()` that actually dials starts a new
/// epoch; a run loop whose epoch is no longer current stops touching state.
pub struct RelayConnection {
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    send_retry_delay: Duration,

    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    attempts: AtomicU32,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    last_error: Mutex<Option<String>>,
    shutdown: Notify,

    outbound_tx: mpsc::UnboundedSender<SignalEnvelope>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalEnvelope>>>,

    message_handlers: Arc<Registry<MessageHandler>>,
    state_handlers: Arc<Registry<StateHandler>>,
    error_handlers: Arc<Registry<ErrorHandler>>,
}

impl RelayConnection {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &ClientConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            factory,
            policy: config.reconnect,
            send_retry_delay: config.send_retry_delay,
            state,
            epoch: AtomicU64::new(0),
            attempts: AtomicU32::new(0),
            transport: Mutex::new(None),
            last_error: Mutex::new(None),
            shutdown: Notify::new(),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            message_handlers: Registry::new(),
            state_handlers: Registry::new(),
            error_handlers: Registry::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Reconnect attempts made since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SignalEnvelope) + Send + Sync + 'static,
    {
        self.message_handlers.add(Arc::new(handler))
    }

    pub fn subscribe_state<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.state_handlers.add(Arc::new(handler))
    }

    pub fn subscribe_errors<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.error_handlers.add(Arc::new(handler))
    }

    /// Connects to the relay, or joins the attempt already in flight.
    ///
    /// Resolves once the attempt settles. A failed first handshake is
    /// reported here exactly once while the reconnect schedule keeps running
    /// in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
        self.start_writer();
        let mut state_rx = self.state.subscribe();

        let mut epoch = None;
        self.state.send_if_modified(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                *state = ConnectionState::Connecting;
                epoch = Some(self.epoch.fetch_add(1, Ordering::SeqCst) + 1);
                true
            }
            _ => false,
        });

        if let Some(epoch) = epoch {
            self.attempts.store(0, Ordering::SeqCst);
            self.set_last_error(None);
            self.notify_state(ConnectionState::Connecting);
            tokio::spawn(self.clone().run(epoch));
        } else {
            debug!(target: "Relay", "Connect requested while {}, joining", self.state());
        }

        let outcome = *state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| ConnectError::Aborted)?;

        match outcome {
            ConnectionState::Connected => Ok(()),
            _ => match self.take_last_error() {
                Some(reason) => Err(ConnectError::Handshake(reason)),
                None => Err(ConnectError::Aborted),
            },
        }
    }

    /// Intentional teardown. Cancels any scheduled reconnect.
    pub async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let transport = self.lock_transport().take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }

        self.force_state(ConnectionState::Disconnected);
        info!(target: "Relay", "Disconnected from relay");
    }

    /// Queues `envelope` for the relay. Dropped envelopes are reported to
    /// error subscribers; nothing is returned to the caller.
    pub fn send(&self, envelope: SignalEnvelope) {
        if let Err(envelope) = self.try_send(envelope) {
            warn!(
                target: "Relay/Send",
                "Dropping `{}` message: relay is {}",
                envelope.kind(),
                self.state()
            );
            self.report(TransportError::Dropped {
                kind: envelope.kind(),
            });
        }
    }

    /// Queues `envelope` only while connected, handing it back otherwise.
    pub fn try_send(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope> {
        if !self.is_connected() {
            return Err(envelope);
        }
        self.outbound_tx.send(envelope).map_err(|e| e.0)
    }

    fn start_writer(self: &Arc<Self>) {
        let receiver = self
            .outbound_rx
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        if let Some(receiver) = receiver {
            tokio::spawn(write_loop(Arc::downgrade(self), receiver));
        }
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        loop {
            if self.is_stale(epoch) {
                return;
            }

            match self.factory.create_transport().await {
                Ok((transport, events)) => {
                    if self.is_stale(epoch) {
                        transport.disconnect().await;
                        return;
                    }
                    *self.lock_transport() = Some(transport.clone());
                    self.attempts.store(0, Ordering::SeqCst);
                    if !self.set_state_for(epoch, ConnectionState::Connected) {
                        transport.disconnect().await;
                        return;
                    }
                    info!(target: "Relay", "Connected to relay");

                    self.pump(epoch, events).await;

                    {
                        let mut slot = self.lock_transport();
                        if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, &transport)) {
                            *slot = None;
                        }
                    }
                    transport.disconnect().await;
                    if self.is_stale(epoch) {
                        return;
                    }
                    warn!(target: "Relay", "Relay connection lost");
                }
                Err(e) => {
                    if self.is_stale(epoch) {
                        return;
                    }
                    warn!(target: "Relay", "Failed to connect to relay: {e}");
                    self.set_last_error(Some(e.to_string()));
                }
            }

            if !self.set_state_for(epoch, ConnectionState::Disconnected) {
                return;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let Some(delay) = self.policy.delay_for(attempt) else {
                let attempts = attempt - 1;
                error!(target: "Relay", "Giving up on relay after {attempts} reconnect attempts");
                if self.set_state_for(epoch, ConnectionState::Failed) {
                    self.report(TransportError::ReconnectExhausted { attempts });
                }
                return;
            };

            info!(
                target: "Relay",
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, self.policy.max_attempts
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => {
                    debug!(target: "Relay", "Reconnect cancelled");
                    return;
                }
            }

            if !self.set_state_for(epoch, ConnectionState::Connecting) {
                return;
            }
        }
    }

    async fn pump(&self, epoch: u64, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                event = events.recv() => match event {
                    Some(TransportEvent::DataReceived(data)) => self.deliver(&data),
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => break,
                }
            }
            if self.is_stale(epoch) {
                break;
            }
        }
    }

    fn deliver(&self, data: &[u8]) {
        match SignalEnvelope::decode(data) {
            Ok(envelope) => {
                trace!(target: "Relay", "<-- {}", envelope.kind());
                for handler in self.message_handlers.snapshot() {
                    handler(&envelope);
                }
            }
            Err(e) => {
                warn!(target: "Relay", "Dropping malformed frame ({} bytes): {e}", data.len());
            }
        }
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    /// Moves to `next` only if `epoch` is still current.
    fn set_state_for(&self, epoch: u64, next: ConnectionState) -> bool {
        let mut current = true;
        let changed = self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                current = false;
                return false;
            }
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            self.notify_state(next);
        }
        current
    }

    fn force_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            self.notify_state(next);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        debug!(target: "Relay", "Connection state -> {state}");
        for handler in self.state_handlers.snapshot() {
            handler(state);
        }
    }

    fn report(&self, error: TransportError) {
        for handler in self.error_handlers.snapshot() {
            handler(&error);
        }
    }

    fn lock_transport(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Transport>>> {
        self.transport.lock().expect("Mutex should not be poisoned")
    }

    fn set_last_error(&self, reason: Option<String>) {
        *self.last_error.lock().expect("Mutex should not be poisoned") = reason;
    }

    fn take_last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.lock_transport().clone()
    }
}

impl SignalSink for RelayConnection {
    fn is_connected(&self) -> bool {
        RelayConnection::is_connected(self)
    }

    fn send(&self, envelope: SignalEnvelope) {
        RelayConnection::send(self, envelope)
    }

    fn try_send(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope> {
        RelayConnection::try_send(self, envelope)
    }
}

/// Drains the outbound queue in order. Holds only a weak reference so the
/// connection can be dropped while the writer is idle.
async fn write_loop(relay: Weak<RelayConnection>, mut outbound: mpsc::UnboundedReceiver<SignalEnvelope>) {
    while let Some(envelope) = outbound.recv().await {
        let Some(relay) = relay.upgrade() else {
            return;
        };

        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "Relay/Send", "Failed to encode `{}`: {e}", envelope.kind());
                relay.report(TransportError::SendFailed(e.to_string()));
                continue;
            }
        };

        let transport = match relay.current_transport() {
            Some(transport) => Some(transport),
            None => {
                debug!(
                    target: "Relay/Send",
                    "No live socket for `{}`, retrying in {:?}",
                    envelope.kind(),
                    relay.send_retry_delay
                );
                tokio::time::sleep(relay.send_retry_delay).await;
                relay.current_transport()
            }
        };

        let Some(transport) = transport else {
            warn!(target: "Relay/Send", "Dropping `{}` message: no live socket", envelope.kind());
            relay.report(TransportError::Undelivered {
                envelope: Box::new(envelope),
                reason: "no live socket".to_string(),
            });
            continue;
        };

        trace!(target: "Relay/Send", "--> {}", envelope.kind());
        if let Err(e) = transport.send(payload.as_bytes()).await {
            warn!(target: "Relay/Send", "Failed to send `{}`: {e}", envelope.kind());
            relay.report(TransportError::Undelivered {
                envelope: Box::new(envelope),
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::wait_until;
    use crate::transport::mock::MockTransportFactory;

    fn relay_with(factory: &MockTransportFactory) -> Arc<RelayConnection> {
        RelayConnection::new(Arc::new(factory.clone()), &ClientConfig::default())
    }

    fn end_call(from: &str, to: &str) -> SignalEnvelope {
        SignalEnvelope::EndCall {
            from: from.into(),
            to: to.into(),
        }
    }

    #[tokio::test]
    async fn test_connect_sets_connected_and_resets_attempts() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);

        relay.connect().await.unwrap();

        assert_eq!(relay.state(), ConnectionState::Connected);
        assert_eq!(relay.attempts(), 0);
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_coalesced() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);

        let (a, b, c) = tokio::join!(relay.connect(), relay.connect(), relay.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(factory.connect_count(), 1);

        relay.connect().await.unwrap();
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handshake_rejects_connect_once_and_keeps_retrying() {
        let factory = MockTransportFactory::new();
        factory.fail_next_connects(2);
        let relay = relay_with(&factory);

        let err = relay.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Handshake(_)));

        // 1s then 2s of backoff, then the third dial succeeds.
        wait_until(|| relay.is_connected()).await;
        assert_eq!(factory.connect_count(), 3);
        assert_eq!(relay.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_failed_after_max_attempts() {
        let factory = MockTransportFactory::new();
        factory.set_unreachable(true);
        let relay = relay_with(&factory);

        let mut states = relay.watch_state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            relay.subscribe_state(move |state| seen.lock().unwrap().push(state))
        };
        let errors = Arc::new(Mutex::new(Vec::new()));
        let _err_sub = {
            let errors = errors.clone();
            relay.subscribe_errors(move |e| errors.lock().unwrap().push(e.clone()))
        };

        let started = tokio::time::Instant::now();
        assert!(relay.connect().await.is_err());
        states
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();

        // One initial dial plus five retries after 1+2+4+8+16 seconds.
        assert_eq!(factory.connect_count(), 6);
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert!(started.elapsed() < Duration::from_secs(32));

        let seen = seen.lock().unwrap();
        assert!(!seen[..seen.len() - 1].contains(&ConnectionState::Failed));
        assert_eq!(seen.last(), Some(&ConnectionState::Failed));
        assert!(matches!(
            errors.lock().unwrap().as_slice(),
            [TransportError::ReconnectExhausted { attempts: 5 }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_failed_resets_attempts() {
        let factory = MockTransportFactory::new();
        factory.set_unreachable(true);
        let relay = relay_with(&factory);
        let mut states = relay.watch_state();

        let _ = relay.connect().await;
        states
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();

        factory.set_unreachable(false);
        relay.connect().await.unwrap();
        assert_eq!(relay.attempts(), 0);
        assert_eq!(factory.connect_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_drop_reconnects() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        relay.connect().await.unwrap();

        factory.drop_connection().await;
        wait_until(|| !relay.is_connected()).await;
        wait_until(|| relay.is_connected()).await;

        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_suppresses_reconnect() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        relay.connect().await.unwrap();

        relay.disconnect().await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(relay.state(), ConnectionState::Disconnected);
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_messages_in_order() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            relay.subscribe(move |env| seen.lock().unwrap().push(format!("a:{}", env.kind())))
        };
        let _second = {
            let seen = seen.clone();
            relay.subscribe(move |env| seen.lock().unwrap().push(format!("b:{}", env.kind())))
        };

        relay.connect().await.unwrap();
        factory.inject(&end_call("bob", "alice")).await;
        wait_until(|| seen.lock().unwrap().len() == 2).await;

        first.unsubscribe();
        factory.inject(&end_call("bob", "alice")).await;
        wait_until(|| seen.lock().unwrap().len() == 3).await;

        assert_eq!(*seen.lock().unwrap(), vec!["a:end", "b:end", "b:end"]);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            relay.subscribe(move |env| seen.lock().unwrap().push(env.clone()))
        };

        relay.connect().await.unwrap();
        factory.inject_raw(b"not json").await;
        factory.inject_raw(br#"{"type":"busy"}"#).await;
        factory.inject(&end_call("bob", "alice")).await;

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec![end_call("bob", "alice")]);
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        relay.connect().await.unwrap();

        for n in 0..5 {
            relay.send(SignalEnvelope::IceCandidate {
                from: "alice".into(),
                to: "bob".into(),
                candidate: format!("c{n}"),
            });
        }

        wait_until(|| factory.sent().len() == 5).await;
        let candidates: Vec<String> = factory
            .sent()
            .into_iter()
            .filter_map(|env| match env {
                SignalEnvelope::IceCandidate { candidate, .. } => Some(candidate),
                _ => None,
            })
            .collect();
        assert_eq!(candidates, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_reported_not_thrown() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let errors = errors.clone();
            relay.subscribe_errors(move |e| errors.lock().unwrap().push(e.clone()))
        };

        relay.send(end_call("alice", "bob"));
        assert!(relay.try_send(end_call("alice", "bob")).is_err());

        assert!(matches!(
            errors.lock().unwrap().as_slice(),
            [TransportError::Dropped { kind: "end" }]
        ));
        assert!(factory.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_hands_envelope_back() {
        let factory = MockTransportFactory::new();
        let relay = relay_with(&factory);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let errors = errors.clone();
            relay.subscribe_errors(move |e| errors.lock().unwrap().push(e.clone()))
        };
        relay.connect().await.unwrap();
        factory.fail_sends(true);

        let candidate = SignalEnvelope::IceCandidate {
            from: "alice".into(),
            to: "bob".into(),
            candidate: "c1".into(),
        };
        relay.send(candidate.clone());

        wait_until(|| !errors.lock().unwrap().is_empty()).await;
        match errors.lock().unwrap().as_slice() {
            [TransportError::Undelivered { envelope, .. }] => assert_eq!(**envelope, candidate),
            other => panic!("unexpected errors: {other:?}"),
        }
        assert!(factory.sent().is_empty());
    }
}
