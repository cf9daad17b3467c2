//! panelgate engine library.
//!
//! The stateful core of a self-service server panel:
//! - SQLite storage for users, devices, tokens, pending actions, tasks and bookings
//! - Step-up confirmation of sensitive requests with single-use tokens
//! - Asynchronous task execution on a bounded worker pool
//! - Revocable bearer credentials backed by an active-token registry
//! - Capacity-checked reservation of CPU, RAM and GPU RAM over time windows

pub mod app;
pub mod audit;
pub mod auth;
pub mod booking;
pub mod confirm;
pub mod delivery;
pub mod error;
pub mod pending;
pub mod storage;
pub mod tasks;
pub mod tokens;

pub use error::{Error, Result};
