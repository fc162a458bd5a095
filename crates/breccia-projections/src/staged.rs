//! Staged tenant views: buffered ops with read-your-writes.
//!
//! During a batch, handler invocations never touch the table store
//! directly. Reads see committed rows overlaid with the batch's earlier
//! buffered writes for the *same tenant*; writes append to an ordered op
//! list that is flushed at commit. Before every event the worker takes a
//! snapshot, so `skip` and `retry` can rewind the view to exactly the
//! pre-event state.

use std::collections::HashMap;

use breccia_store::{Row, TableOp, TableStore, Value};
use breccia_types::TenantId;

/// The buffered state of one tenant within one batch.
#[derive(Debug, Default)]
pub struct StagedView {
    /// Key → `Some(row)` for buffered upserts, `None` for buffered deletes.
    overlay: HashMap<Value, Option<Row>>,
    /// Ordered ops as the handler issued them.
    ops: Vec<TableOp>,
}

/// A rewind point taken before one event.
#[derive(Debug)]
pub struct ViewSnapshot {
    overlay: HashMap<Value, Option<Row>>,
    ops_len: usize,
}

impl StagedView {
    /// Creates an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the view state before an event.
    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            overlay: self.overlay.clone(),
            ops_len: self.ops.len(),
        }
    }

    /// Rewinds to a snapshot, discarding the event's staged effects.
    pub fn restore(&mut self, snapshot: ViewSnapshot) {
        self.overlay = snapshot.overlay;
        self.ops.truncate(snapshot.ops_len);
    }

    /// Consumes the view into its ordered op list.
    pub fn into_ops(self) -> Vec<TableOp> {
        self.ops
    }

    /// `true` if the batch buffered no ops for this tenant.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The ops buffered so far (for determinism comparison).
    pub fn ops(&self) -> &[TableOp] {
        &self.ops
    }
}

/// The handler-facing view: one tenant's staged state over the table.
pub struct StagedTable<'a> {
    tenant_id: &'a TenantId,
    table: &'a TableStore,
    view: &'a mut StagedView,
}

impl<'a> StagedTable<'a> {
    /// Binds a staged view to its backing table for one handler call.
    pub fn new(tenant_id: &'a TenantId, table: &'a TableStore, view: &'a mut StagedView) -> Self {
        Self {
            tenant_id,
            table,
            view,
        }
    }

    /// The tenant this view is scoped to.
    pub fn tenant_id(&self) -> &TenantId {
        self.tenant_id
    }

    /// Reads a row: buffered writes first, then committed state.
    pub fn get(&self, key: &Value) -> Option<Row> {
        match self.view.overlay.get(key) {
            Some(Some(row)) => Some(row.clone()),
            Some(None) => None, // buffered delete
            None => self.table.read_row(self.tenant_id, key),
        }
    }

    /// Buffers an upsert, visible to later events of the batch.
    pub fn set(&mut self, key: Value, row: Row) {
        self.view.overlay.insert(key.clone(), Some(row.clone()));
        self.view.ops.push(TableOp::Upsert { key, row });
    }

    /// Buffers a delete, visible to later events of the batch.
    pub fn delete(&mut self, key: Value) {
        self.view.overlay.insert(key.clone(), None);
        self.view.ops.push(TableOp::Delete { key });
    }
}
