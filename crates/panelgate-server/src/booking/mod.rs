//! Time-window reservations of the machine's CPU, RAM and GPU RAM.
//!
//! Capacity comes from configuration and each dimension is checked on its
//! own. Proposals are validated against current bookings and validated
//! again under the capacity lock when committed, so of two proposals that
//! jointly exceed capacity at most one is stored.

mod allocator;
pub mod sweep;

pub use allocator::{BookingAllocator, BookingRequest, ValidatedBooking};
pub use sweep::Resources;
