//! HTTP gateway for the Planforge platform.
//!
//! The client submission API: job intake, state reads, artifact access and
//! export, the HITL approve / request-changes surface, live event streaming
//! over Server-Sent Events, metrics, and module-catalog administration.
//!
//! # Main types
//!
//! - [`GatewayServer`] — Builds the axum router over an [`AppState`].
//! - [`AppState`] — Shared component handles.

/// Error-to-HTTP mapping.
pub mod error;
/// REST route handlers.
pub mod routes;
/// Router assembly and shared state.
pub mod server;
/// SSE event streaming.
pub mod stream;

pub use error::ApiError;
pub use server::{AppState, GatewayServer};
