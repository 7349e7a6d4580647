//! Per-user session state.
//!
//! One [`Session`] exists per (platform user, workspace). It carries the
//! identity link, the duplicate-delivery marker, the busy flag and the
//! single-slot pending confirmation.

mod store;
mod types;

pub use store::{SessionStore, TurnStart};
pub use types::{LinkState, PendingConfirmation, PendingVerification, Session};
