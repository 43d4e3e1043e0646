//! Platform-independent signaling core.
//!
//! Nothing in this crate performs I/O. It defines the wire vocabulary, the
//! call session state machine, the reconnect policy and the seams
//! (`Transport`, `PeerTransport`, `IdentityProvider`) that the runtime client
//! plugs concrete implementations into.

pub mod identity;
pub mod net;
pub mod peer;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod types;

pub use identity::{IdentityProvider, StaticIdentity};
pub use net::{ConnectionState, Transport, TransportEvent, TransportFactory};
pub use peer::{PeerEvent, PeerSessionId, PeerTransport};
pub use protocol::{ParticipantId, ProtocolError, SignalEnvelope};
pub use reconnect::ReconnectPolicy;
pub use session::{CallSession, CallState, CallTransition, InvalidTransition};
pub use types::events::{CoreEventBus, EndReason, ErrorKind, ErrorNotice, Event, EventHandler};
