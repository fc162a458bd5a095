//! The projection handler contract.
//!
//! A handler is a deterministic function from events to table ops: given
//! the same event and the same staged view, it must produce the same ops.
//! Determinism is a registration contract, not something the runtime can
//! prove — but see [`ProjectionOptions::check_determinism`] for a test
//! mode that re-runs every batch and diffs the op lists.

use std::fmt;
use std::time::Duration;

use breccia_types::{Event, TenantId};

use crate::staged::StagedTable;

/// Default events per delivered batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default idle poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An error raised by a projection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// What the worker does after a handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Drop the event's staged effects and move on; the checkpoint still
    /// covers it.
    Skip,
    /// Re-seed the staged view to the pre-event snapshot and re-invoke the
    /// handler once; a second failure stops the worker.
    Retry,
    /// Stop the worker. Terminal until restarted.
    Stop,
}

/// User-defined projection logic.
///
/// Handlers run on the projection's worker thread. `apply` must be
/// deterministic; `on_error` decides the fate of a failing event.
pub trait ProjectionHandler: Send + 'static {
    /// Routes an event to the tenant whose staged view it may touch.
    /// Defaults to the tenant the event was written under.
    fn tenant_of(&self, event: &Event) -> TenantId {
        event.tenant_id.clone()
    }

    /// Selects which events reach `apply`. Filtered-out events still
    /// advance the checkpoint. Defaults to everything.
    fn filter(&self, _event: &Event) -> bool {
        true
    }

    /// Transforms one event into table ops via the staged view.
    fn apply(&mut self, event: &Event, table: &mut StagedTable<'_>) -> Result<(), HandlerError>;

    /// Error policy. Defaults to stopping the worker.
    fn on_error(&self, _error: &HandlerError, _event: &Event) -> ErrorAction {
        ErrorAction::Stop
    }
}

/// Per-projection runtime tuning.
#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    /// Events fetched and applied per batch.
    pub batch_size: usize,
    /// Sleep between polls when caught up with the log.
    pub poll_interval: Duration,
    /// Re-run every batch a second time and compare op lists; a mismatch
    /// fails the worker loudly. For tests of handler determinism.
    pub check_determinism: bool,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            check_determinism: false,
        }
    }
}
