//! State Store for the Planforge platform.
//!
//! The sole source of durable truth: jobs, tasks, artifacts, events, truth
//! records, the module catalog, and skill allowlists all live here. The
//! store exposes only the transactional operations the other components
//! need; every write is conditional on the expected current value, and the
//! task/job transition graphs are enforced inside the store rather than
//! trusted at the callers.
//!
//! # Main types
//!
//! - [`StateStore`] — The transactional operation surface.
//! - [`MemoryStateStore`] — In-memory implementation; the default for tests
//!   and the demo profile.
//! - [`FileStateStore`] — Same semantics with write-through JSON persistence.

/// Write-through file-backed implementation.
pub mod file;
/// In-memory implementation.
pub mod memory;
/// The `StateStore` trait.
pub mod state;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use state::StateStore;
