// Core types live in callcore so they can be shared with other front ends
pub use callcore::{
    CallSession, CallState, ConnectionState, CoreEventBus, EndReason, ErrorKind, ErrorNotice,
    Event, EventHandler, IdentityProvider, ParticipantId, PeerEvent, PeerSessionId, PeerTransport,
    ReconnectPolicy, SignalEnvelope, StaticIdentity,
};

pub mod calls;
pub mod client;
pub mod config;
pub mod identity;
pub mod relay;
pub mod transport;
pub mod webrtc_peer;

#[cfg(test)]
mod test_utils;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use identity::FileIdentityStore;
pub use webrtc_peer::WebRtcPeer;
