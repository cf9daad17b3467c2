//! SQLite storage for panelgate.
//!
//! Provides persistence for users, fingerprints, active tokens, pending
//! actions, async tasks, bookings and the operation log.

mod db;
mod models;
pub mod queries;
pub mod queries_audit;
pub mod queries_bookings;
pub mod queries_pending;
pub mod queries_tasks;
pub mod queries_tokens;


pub use db::{DatabaseError, PanelDatabase, Tx};
pub use models::*;
pub use queries_audit::LogPage;
pub use queries_pending::NewPendingAction;
pub use queries_tokens::NewActiveToken;
