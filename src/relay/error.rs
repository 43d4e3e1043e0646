use std::time::Duration;

use callcore::SignalEnvelope;
use thiserror::Error;

/// Failure of a directly awaited `connect()`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("local identity not available after {0:?}")]
    IdentityTimeout(Duration),

    #[error("failed to resolve local identity: {0}")]
    Identity(String),

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    #[error("connect aborted by disconnect")]
    Aborted,
}

/// Background relay failures. These reach error subscribers, never callers.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("relay not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("dropped outbound `{kind}` message")]
    Dropped { kind: &'static str },

    /// Accepted for sending but lost before it reached the socket.
    #[error("`{}` message not delivered: {reason}", envelope.kind())]
    Undelivered {
        envelope: Box<SignalEnvelope>,
        reason: String,
    },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}
