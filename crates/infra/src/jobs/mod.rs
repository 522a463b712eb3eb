//! Durable job queue.
//!
//! ## Design
//!
//! - One job row per workflow step; the row is the only state that survives a restart
//! - A single collector polls storage and routes due jobs to a fixed worker pool
//! - Jobs of one entity (`related_id`) always land on the same worker, so they run
//!   one at a time, oldest first
//! - Failures are retried per job type; a cancellation made while a handler runs wins
//! - In-memory completion subscriptions per entity
//!
//! ## Components
//!
//! - `Queue`: enqueue, process, close, subscribe
//! - `JobStore`: persistence port (in-memory and Postgres adapters)
//! - `HandlerRegistry`: job type to business handler
//! - `QueueConfig`: sweep settings and per-type policies

mod collector;
pub mod config;
pub mod error;
pub mod handler;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod subscription;
mod worker;

pub use config::QueueConfig;
pub use error::QueueError;
pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use memory::{InMemoryJobStore, MemoryTx};
pub use postgres::PostgresJobStore;
pub use queue::Queue;
pub use store::{JobStore, ServiceStore, StoreError};
pub use subscription::{Callback, Subscriptions};
