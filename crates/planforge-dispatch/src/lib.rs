//! Task dispatch layer for the Planforge platform.
//!
//! A per-role priority queue with claim/lease/heartbeat discipline feeding a
//! pool of concurrent worker executors. Execution is at-least-once: a crash
//! after claim is recovered by lease expiry, retries re-queue with
//! exponential backoff, and everything downstream is idempotent.
//!
//! # Main types
//!
//! - [`Dispatcher`] — Queues, claims, leases, retries, backpressure.
//! - [`WorkerPool`] — Long-lived worker loops executing role handlers.
//! - [`RoleHandler`] / [`HandlerRegistry`] — The seam where opaque agent
//!   implementations plug in.
//! - [`RoleQueues`] — Priority/FIFO queue index per role.

/// Dispatcher: claims, leases, retries, backpressure.
pub mod dispatcher;
/// The role-handler seam.
pub mod handler;
/// Priority queue index.
pub mod queue;
/// Worker pool executing handlers.
pub mod worker;

pub use dispatcher::{Dispatcher, FailureDisposition, WorkerRegistration};
pub use handler::{DependencyOutput, HandlerContext, HandlerOutcome, HandlerRegistry, RoleHandler};
pub use queue::RoleQueues;
pub use worker::WorkerPool;
