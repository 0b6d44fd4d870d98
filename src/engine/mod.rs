//! Pure computation engines: commission rules and the withdrawal lifecycle.

pub mod commission;
pub mod lifecycle;

pub use commission::compute_credits;
pub use lifecycle::{plan, InvalidTransition, LedgerEffect, LifecycleEvent, Transition};
