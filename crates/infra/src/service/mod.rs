//! Service lifecycle on top of the job queue.

pub mod transition;

pub use transition::{TransitionError, TransitionGuard};
