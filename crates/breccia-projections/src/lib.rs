//! # breccia-projections: Projection runtime
//!
//! Projections turn the global event log into queryable, tenant-scoped
//! tables. Each registered projection owns a [`breccia_store::TableStore`]
//! and processes events in global order with a durable checkpoint; the
//! batch apply and the checkpoint advance are one atomic store operation,
//! so a deterministic handler has exactly-once effect even though delivery
//! is at-least-once.
//!
//! Two consumption modes per projection, mutually exclusive:
//!
//! 1. **Worker mode**: [`ProjectionRegistry::start`] spawns a long-running
//!    worker thread driving a [`ProjectionHandler`].
//! 2. **Poll mode**: the embedder drives the loop itself via
//!    [`ProjectionRegistry::get_events`] and
//!    [`ProjectionRegistry::apply_batch`].

pub mod handler;
pub mod registry;
pub mod staged;
pub mod worker;

pub use handler::{ErrorAction, HandlerError, ProjectionHandler, ProjectionOptions};
pub use registry::{EventBatch, ProjectionRegistry};
pub use staged::{StagedTable, StagedView};

use breccia_types::{Event, GlobalPos};
use thiserror::Error;

/// Where projection workers read events from. Implemented by the store
/// facade over its log reader; object-safe so the runtime never depends on
/// the storage crate.
pub trait EventSource: Send + Sync + 'static {
    /// Reads up to `max_count` events in global order starting at `from`.
    /// Reaching the durable head returns the partial result.
    fn read_global(&self, from: GlobalPos, max_count: usize) -> Result<Vec<Event>>;
}

/// Errors from the projection runtime.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A projection with this name is already registered.
    #[error("projection {0} already registered")]
    AlreadyExists(String),

    /// No projection with this name is registered.
    #[error("projection {0} not found")]
    NotFound(String),

    /// The operation conflicts with a running worker.
    #[error("projection {0} has a running worker")]
    WorkerActive(String),

    /// State store failure (including checkpoint regression).
    #[error(transparent)]
    Store(#[from] breccia_store::StoreError),

    /// The event source failed.
    #[error("event source error: {0}")]
    Source(String),
}

/// Result alias for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
