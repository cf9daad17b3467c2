//! Step-up confirmation.
//!
//! A sensitive request becomes a pending action bound to a single-use
//! confirmation token that is delivered out-of-band. Presenting the token
//! consumes the action exactly once.

pub mod action;
mod engine;

pub use action::{ActionPayload, ActionType};
pub use engine::{ConsumedAction, PendingActionEngine, PendingConfig};
