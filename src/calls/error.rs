//! Call-related error types.

use callcore::{InvalidTransition, ParticipantId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("not connected to the relay")]
    NotConnected,

    #[error("already in a call with {remote}")]
    Busy { remote: ParticipantId },

    #[error("no incoming call")]
    NoIncomingCall,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The call changed while the operation was suspended.
    #[error("call ended or changed before the operation completed")]
    Superseded,
}
