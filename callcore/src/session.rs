//! Call session state machine.
//!
//! There is at most one session per process. It starts in `Idle`, and every
//! call, however it ends, passes through `Ending` back to `Idle`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

use crate::protocol::ParticipantId;

/// Current state of the call. Every state but `Idle` names the remote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum CallState {
    #[default]
    Idle,
    /// Incoming call ringing locally.
    Ringing(ParticipantId),
    /// Outgoing call: request sent, offer pending or sent, awaiting answer.
    Outgoing(ParticipantId),
    /// Incoming call accepted, awaiting or processing the remote offer.
    Negotiating(ParticipantId),
    /// Descriptions exchanged.
    Active(ParticipantId),
    /// Tearing down; peer resources are being released.
    Ending(ParticipantId),
}

impl CallState {
    pub fn remote(&self) -> Option<&ParticipantId> {
        match self {
            Self::Idle => None,
            Self::Ringing(r)
            | Self::Outgoing(r)
            | Self::Negotiating(r)
            | Self::Active(r)
            | Self::Ending(r) => Some(r),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing(_))
    }

    /// Ringing, outgoing, negotiating or active.
    pub fn is_in_call(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ending(_))
    }

    /// Remote of a call that is still in progress (not idle, not ending).
    pub fn live_remote(&self) -> Option<&ParticipantId> {
        if self.is_in_call() { self.remote() } else { None }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Ringing(_) => "Ringing",
            Self::Outgoing(_) => "Outgoing",
            Self::Negotiating(_) => "Negotiating",
            Self::Active(_) => "Active",
            Self::Ending(_) => "Ending",
        }
    }
}

/// State transitions for the call session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTransition {
    /// Local user places a call.
    Dial { remote: ParticipantId },
    /// A call request arrived from `from`.
    IncomingCall { from: ParticipantId },
    LocalAccepted,
    /// Remote answer applied on the caller side.
    AnswerApplied,
    /// Local answer sent on the callee side.
    AnswerSent,
    /// Local hangup/reject, remote hangup or failure; resources still held.
    Hangup,
    /// Peer resources released.
    Released,
}

/// The single mutable record describing the pending or in-progress call.
#[derive(Debug, Default)]
pub struct CallSession {
    pub state: CallState,
    /// Locally generated candidates not yet handed to the relay, in generation order.
    pub pending_local_ice: VecDeque<String>,
    /// How many candidates at the front of `pending_local_ice` came back
    /// undelivered since the last flush.
    pub returned_local_ice: usize,
    /// Remote candidates received before a remote description was applied.
    pub pending_remote_ice: Vec<String>,
    /// Offer received while still ringing; consumed on accept.
    pub held_offer: Option<String>,
    pub remote_description_applied: bool,
    /// Bumped whenever a call begins or is torn down. Continuations that
    /// resume with a different generation belong to a call that is gone.
    pub generation: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote(&self) -> Option<&ParticipantId> {
        self.state.remote()
    }

    /// True when the session is still the call identified by `generation`
    /// and that call is in `expected` state with the same remote.
    pub fn is_current(&self, generation: u64, expected: &CallState) -> bool {
        self.generation == generation && &self.state == expected
    }

    /// Puts back a candidate the relay accepted but never wrote. Returned
    /// candidates keep their relative order and stay ahead of anything
    /// gathered after them.
    pub fn return_local_candidate(&mut self, candidate: String) {
        let at = self.returned_local_ice.min(self.pending_local_ice.len());
        self.pending_local_ice.insert(at, candidate);
        self.returned_local_ice = at + 1;
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|at| Utc::now().signed_duration_since(at).num_seconds())
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::Dial { remote }) => {
                self.generation += 1;
                CallState::Outgoing(remote)
            }
            (CallState::Idle, CallTransition::IncomingCall { from }) => {
                self.generation += 1;
                CallState::Ringing(from)
            }
            (CallState::Ringing(r), CallTransition::LocalAccepted) => {
                CallState::Negotiating(r.clone())
            }
            (CallState::Outgoing(r), CallTransition::AnswerApplied)
            | (CallState::Negotiating(r), CallTransition::AnswerSent) => {
                self.connected_at = Some(Utc::now());
                CallState::Active(r.clone())
            }
            (
                CallState::Ringing(r)
                | CallState::Outgoing(r)
                | CallState::Negotiating(r)
                | CallState::Active(r),
                CallTransition::Hangup,
            ) => CallState::Ending(r.clone()),
            (CallState::Ending(_), CallTransition::Released) => CallState::Idle,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        let released = new_state.is_idle();
        self.state = new_state;
        if released {
            self.clear_call_data();
        }
        Ok(())
    }

    fn clear_call_data(&mut self) {
        self.pending_local_ice.clear();
        self.returned_local_ice = 0;
        self.pending_remote_ice.clear();
        self.held_offer = None;
        self.remote_description_applied = false;
        self.connected_at = None;
        self.generation += 1;
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
