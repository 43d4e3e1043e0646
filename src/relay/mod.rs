//! Resilient client connection to the signaling relay.

pub mod connection;
pub mod error;
pub mod handlers;

pub use connection::RelayConnection;
pub use error::{ConnectError, TransportError};
pub use handlers::Subscription;

use callcore::SignalEnvelope;

/// Outbound side of the relay as seen by the call layer.
pub trait SignalSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Queues `envelope`; a drop is reported through the relay's error
    /// subscribers.
    fn send(&self, envelope: SignalEnvelope);

    /// Queues `envelope` only while connected, handing it back otherwise.
    fn try_send(&self, envelope: SignalEnvelope) -> Result<(), SignalEnvelope>;
}
