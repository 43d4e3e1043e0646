//! Capability the call layer needs from the peer-to-peer media transport.
//!
//! Descriptions and candidates cross this boundary as opaque strings; the
//! call layer relays them and never looks inside.

use async_trait::async_trait;

/// Identifies one peer session. `close()` ends the current session, so
/// events tagged with an older id describe a connection that is gone.
pub type PeerSessionId = u64;

/// Events emitted by a peer transport, in the order they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered.
    LocalIceCandidate {
        session: PeerSessionId,
        candidate: String,
    },
    /// Remote media started flowing.
    RemoteMediaAvailable { session: PeerSessionId },
    /// The peer connection failed for good.
    ConnectionClosed { session: PeerSessionId },
}

impl PeerEvent {
    pub fn session(&self) -> PeerSessionId {
        match self {
            Self::LocalIceCandidate { session, .. }
            | Self::RemoteMediaAvailable { session }
            | Self::ConnectionClosed { session } => *session,
        }
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// The session new events are tagged with.
    fn current_session(&self) -> PeerSessionId;

    /// Creates and applies a local offer; returns the serialized description.
    async fn create_offer(&self) -> Result<String, anyhow::Error>;

    /// Applies the remote offer, then creates and applies a local answer.
    async fn create_answer(&self, remote_sdp: &str) -> Result<String, anyhow::Error>;

    /// Applies the remote answer to a previously created offer.
    async fn apply_answer(&self, remote_sdp: &str) -> Result<(), anyhow::Error>;

    async fn add_remote_ice_candidate(&self, candidate: &str) -> Result<(), anyhow::Error>;

    /// Releases the current session and moves on to the next id. The next
    /// offer or answer starts a fresh connection.
    async fn close(&self);
}
