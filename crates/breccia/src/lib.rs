//! # Breccia
//!
//! An embedded, append-only event store with per-stream optimistic
//! concurrency, a total global order, strict tenant isolation, adaptive
//! admission control, and a projection runtime with exactly-once
//! checkpointed effects.
//!
//! ## Quick tour
//!
//! - [`Breccia::open`] recovers the log (torn batches are truncated, the
//!   stream index is rebuilt) and spawns the store's background workers.
//! - [`Breccia::append`] / [`Breccia::append_batch`] are the write path:
//!   admission control, group commit, one fsync per drain, and visibility
//!   strictly after durability.
//! - [`Breccia::read_stream`] / [`Breccia::read_global`] read directly
//!   from segment files without blocking the writer.
//! - [`Breccia::register_projection`] + [`Breccia::start_projection`] run
//!   user handlers over the log with per-projection checkpoints; poll-mode
//!   equivalents exist for embedders that drive the loop themselves.
//!
//! ## Layout on disk
//!
//! ```text
//! <root>/
//!   events/                       append-only segment files
//!     events-00000000000000000001.seg
//!   projections/
//!     <name>.table                schema + rows + checkpoint
//! ```

mod admission;
mod breccia;
mod commit;
mod error;

pub use crate::admission::{AdmissionConfig, MetricsSnapshot};
pub use crate::breccia::{Breccia, StoreConfig};
pub use crate::error::{Error, Result};

// The domain vocabulary, re-exported for embedders.
pub use breccia_projections::{
    ErrorAction, EventBatch, HandlerError, ProjectionError, ProjectionHandler,
    ProjectionOptions, StagedTable,
};
pub use breccia_store::{ColumnDef, ColumnType, Row, Schema, StoreError, TableOp, Value};
pub use breccia_types::{
    AppendCommand, AppendResult, CommandId, Event, EventData, ExpectedRevision, GlobalPos,
    StreamId, StreamRev, TenantId, Timestamp,
};
