use serde::Serialize;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::net::ConnectionState;
use crate::protocol::ParticipantId;

/// Why a call returned to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local user hung up or cancelled.
    LocalHangup,
    /// Local user declined an incoming call.
    Rejected,
    /// Remote sent an end message.
    RemoteHangup,
    /// The peer transport reported a terminal failure.
    PeerFailure,
    /// Creating or applying a description failed.
    NegotiationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Transport,
    Negotiation,
}

/// A non-fatal failure surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorNotice {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Event {
    /// Relay connection state changed.
    Connection(ConnectionState),
    IncomingCall {
        from: ParticipantId,
    },
    CallActive {
        remote: ParticipantId,
    },
    CallEnded {
        remote: ParticipantId,
        reason: EndReason,
        duration_secs: Option<i64>,
    },
    RemoteMedia {
        remote: Option<ParticipantId>,
    },
    Error(ErrorNotice),
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Default, Clone)]
pub struct CoreEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(handler);
    }

    /// Returns true if there are any event handlers registered.
    pub fn has_handlers(&self) -> bool {
        !self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .is_empty()
    }

    pub fn dispatch(&self, event: &Event) {
        for handler in self
            .handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
        {
            handler.handle_event(event);
        }
    }
}
