//! `steward-core`: domain building blocks for the job scheduler.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the persisted job record, its status machine, per-type retry policy, the
//! service status an entity moves through, and the clock port.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod policy;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobStatus};
pub use policy::{BackoffStrategy, TypePolicy};
pub use service::ServiceStatus;
