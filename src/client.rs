use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use callcore::{
    CallState, ConnectionState, CoreEventBus, ErrorKind, ErrorNotice, Event, EventHandler,
    IdentityProvider, ParticipantId, PeerEvent, PeerTransport, SignalEnvelope, TransportFactory,
};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::calls::{CallError, CallManager};
use crate::config::ClientConfig;
use crate::relay::{ConnectError, RelayConnection, Subscription, TransportError};
use crate::transport::TokioWebSocketTransportFactory;
use crate::webrtc_peer::WebRtcPeer;

/// Everything that mutates the call session funnels through one queue and
/// is applied by a single task, in arrival order.
enum DispatchEvent {
    Inbound(SignalEnvelope),
    Peer(PeerEvent),
    Connection(ConnectionState),
    TransportError(TransportError),
}

/// The composition root: one relay connection, one call manager, one
/// event bus.
pub struct Client {
    config: ClientConfig,
    relay: Arc<RelayConnection>,
    calls: Arc<CallManager>,
    identity: Arc<dyn IdentityProvider>,
    event_bus: CoreEventBus,
    subscriptions: Mutex<Vec<Subscription>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    fn new(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
        identity: Arc<dyn IdentityProvider>,
        peer: Arc<dyn PeerTransport>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Arc<Self> {
        let event_bus = CoreEventBus::new();
        let relay = RelayConnection::new(factory, &config);
        let calls = Arc::new(CallManager::new(relay.clone(), peer, event_bus.clone()));
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        // Registration goes first so Register leaves before any queued
        // candidates are flushed on (re)connect.
        let register = {
            let weak_relay = Arc::downgrade(&relay);
            let weak_calls = Arc::downgrade(&calls);
            relay.subscribe_state(move |state| {
                if !state.is_connected() {
                    return;
                }
                let (Some(relay), Some(calls)) = (weak_relay.upgrade(), weak_calls.upgrade())
                else {
                    return;
                };
                match calls.local_id() {
                    Some(user_id) => {
                        debug!(target: "Relay", "Registering as {user_id}");
                        relay.send(SignalEnvelope::Register { user_id });
                    }
                    None => {
                        debug!(target: "Relay", "Connected without a local id, not registering")
                    }
                }
            })
        };
        let subscriptions = vec![
            register,
            {
                let tx = dispatch_tx.clone();
                relay.subscribe_state(move |state| {
                    let _ = tx.send(DispatchEvent::Connection(state));
                })
            },
            {
                let tx = dispatch_tx.clone();
                relay.subscribe(move |envelope| {
                    let _ = tx.send(DispatchEvent::Inbound(envelope.clone()));
                })
            },
            {
                let tx = dispatch_tx.clone();
                relay.subscribe_errors(move |error| {
                    let _ = tx.send(DispatchEvent::TransportError(error.clone()));
                })
            },
        ];

        let tx = dispatch_tx;
        let tasks = vec![
            tokio::spawn(async move {
                while let Some(event) = peer_events.recv().await {
                    if tx.send(DispatchEvent::Peer(event)).is_err() {
                        break;
                    }
                }
            }),
            tokio::spawn(dispatch_loop(calls.clone(), event_bus.clone(), dispatch_rx)),
        ];

        Arc::new(Self {
            config,
            relay,
            calls,
            identity,
            event_bus,
            subscriptions: Mutex::new(subscriptions),
            tasks,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &CoreEventBus {
        &self.event_bus
    }

    pub fn add_event_handler(&self, handler: Arc<dyn EventHandler>) {
        self.event_bus.add_handler(handler);
    }

    pub fn relay(&self) -> &Arc<RelayConnection> {
        &self.relay
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.relay.state()
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    pub fn call_state(&self) -> CallState {
        self.calls.state()
    }

    /// The local id, once `connect()` has resolved it.
    pub fn local_id(&self) -> Option<ParticipantId> {
        self.calls.local_id()
    }

    /// Resolves the local identity (bounded by `identity_timeout`) and
    /// connects to the relay.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.calls.local_id().is_none() {
            let timeout = self.config.identity_timeout;
            let id = tokio::time::timeout(timeout, self.identity.local_id())
                .await
                .map_err(|_| ConnectError::IdentityTimeout(timeout))?
                .map_err(|e| ConnectError::Identity(e.to_string()))?;
            info!(target: "Identity", "Local participant is {id}");
            self.calls.set_local_id(id);
        }
        self.relay.connect().await
    }

    pub async fn disconnect(&self) {
        self.relay.disconnect().await;
    }

    pub async fn call_user(&self, remote: impl Into<ParticipantId>) -> Result<(), CallError> {
        self.calls.call_user(remote.into()).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.calls.accept_call().await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.calls.reject_call().await
    }

    pub async fn end_call(&self) {
        self.calls.end_call().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for subscription in subscriptions.drain(..) {
                subscription.unsubscribe();
            }
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn dispatch_loop(
    calls: Arc<CallManager>,
    event_bus: CoreEventBus,
    mut events: mpsc::UnboundedReceiver<DispatchEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Inbound(envelope) => calls.handle_signal(envelope).await,
            DispatchEvent::Peer(event) => calls.handle_peer_event(event).await,
            DispatchEvent::Connection(state) => {
                event_bus.dispatch(&Event::Connection(state));
                calls.handle_connection_state(state);
            }
            DispatchEvent::TransportError(error) => {
                event_bus.dispatch(&Event::Error(ErrorNotice::new(
                    ErrorKind::Transport,
                    error.to_string(),
                )));
                if let TransportError::Undelivered { envelope, .. } = error {
                    calls.handle_undelivered(*envelope);
                }
            }
        }
    }
    debug!(target: "Call", "Dispatch loop finished");
}

type EventHandlerCallback =
    Arc<dyn Fn(Event, Arc<Client>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct ClientEventHandler {
    client: Weak<Client>,
    event_handler: EventHandlerCallback,
}

impl EventHandler for ClientEventHandler {
    fn handle_event(&self, event: &Event) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let handler = self.event_handler.clone();
        let event = event.clone();
        tokio::spawn(async move {
            handler(event, client).await;
        });
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    peer: Option<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>)>,
    event_handler: Option<EventHandlerCallback>,
}

impl ClientBuilder {
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the WebSocket transport built from `server_url`.
    pub fn with_transport_factory<F>(mut self, factory: F) -> Self
    where
        F: TransportFactory + 'static,
    {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_identity<I>(mut self, identity: I) -> Self
    where
        I: IdentityProvider + 'static,
    {
        self.identity = Some(Arc::new(identity));
        self
    }

    /// Overrides the default WebRTC peer transport.
    pub fn with_peer(
        mut self,
        peer: Arc<dyn PeerTransport>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Self {
        self.peer = Some((peer, events));
        self
    }

    pub fn on_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Event, Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.event_handler = Some(Arc::new(move |event, client| {
            Box::pin(handler(event, client))
        }));
        self
    }

    pub async fn build(self) -> Result<Arc<Client>, anyhow::Error> {
        let config = self.config.unwrap_or_default();
        let identity = self
            .identity
            .ok_or_else(|| anyhow::anyhow!("an identity provider is required"))?;
        let factory = self.transport_factory.unwrap_or_else(|| {
            Arc::new(TokioWebSocketTransportFactory::new(config.server_url.clone()))
        });
        let (peer, peer_events) = match self.peer {
            Some(peer) => peer,
            None => {
                let (peer, events) = WebRtcPeer::new();
                (peer as Arc<dyn PeerTransport>, events)
            }
        };

        let client = Client::new(config, factory, identity, peer, peer_events);
        if let Some(event_handler) = self.event_handler {
            client.add_event_handler(Arc::new(ClientEventHandler {
                client: Arc::downgrade(&client),
                event_handler,
            }));
        }
        info!(target: "Call", "Client ready for {}", client.config.server_url);
        Ok(client)
    }
}
