//! Call orchestration on top of the relay connection.
//!
//! - [`CallManager`]: owns the single [`CallSession`](callcore::CallSession)
//!   and applies local commands and inbound envelopes to it.
//! - [`NegotiationCoordinator`]: drives the peer transport and reconciles the
//!   local and remote ICE candidate streams.

mod error;
mod manager;
mod negotiation;

pub use error::CallError;
pub use manager::CallManager;
pub use negotiation::NegotiationCoordinator;
