//! # Lifeline Sync
//!
//! Keeps the document store and the graph store consistent.
//!
//! The [`TransactionCoordinator`] applies each logical write to both stores
//! inside one transaction per store, retrying the unit with linear backoff.
//! When the graph store is unreachable it can fall back to the document store
//! alone and hand the graph half to the [`DegradationService`], which monitors
//! both stores and replays the deferred mutations once the graph recovers.

pub mod coordinator;
pub mod degradation;
pub mod queue;

mod apply;

pub use coordinator::{CreateEntity, TransactionCoordinator, TransactionOptions, UpdateEntity};
pub use degradation::{DegradationService, DrainReport};
pub use queue::UnsyncedQueue;
