//! Event bus for the Planforge platform.
//!
//! An append-only per-job log with live fan-out. Events are durably
//! persisted through the State Store **before** any subscriber sees them; a
//! fan-out failure never rolls back the durable write. Live delivery is
//! at-least-once within a subscription: late joiners replay history by
//! sequence number and deduplicate at the boundary.
//!
//! # Main types
//!
//! - [`EventBus`] — Publish, subscribe, and history reads.
//! - [`Subscription`] — A live stream handle with optional replay prefix.
//! - [`SubscriberFilter`] — One job or the whole platform.

/// The bus implementation.
pub mod bus;
/// Module-catalog cache with invalidation notifications.
pub mod catalog;

pub use bus::{EventBus, SubscriberFilter, Subscription};
pub use catalog::CatalogCache;
