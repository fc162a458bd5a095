//! Projection registry: registration, worker lifecycle, poll-mode API.
//!
//! The registry owns one [`TableStore`] per projection plus the optional
//! worker driving it. A projection is consumed either by its worker or by
//! the embedder polling `get_events`/`apply_batch`, never both at once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use breccia_store::{Row, Schema, TableOp, TableStore, Value};
use breccia_types::{Event, GlobalPos, TenantId};

use crate::handler::{ProjectionHandler, ProjectionOptions};
use crate::worker::{spawn_worker, WorkerHandle};
use crate::{EventSource, ProjectionError, Result};

/// A batch handed to a poll-mode consumer.
#[derive(Debug, Clone)]
pub struct EventBatch {
    /// The projection this batch is for.
    pub projection_name: String,
    /// Events in global order, starting at `checkpoint + 1`.
    pub events: Vec<Event>,
    /// The checkpoint to acknowledge with: the last event's position.
    pub last_global_pos: GlobalPos,
}

struct ProjectionSlot {
    table: Arc<Mutex<TableStore>>,
    options: ProjectionOptions,
    worker: Option<WorkerHandle>,
}

impl ProjectionSlot {
    fn worker_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_running())
    }
}

/// Registry of all projections of one store.
pub struct ProjectionRegistry {
    dir: PathBuf,
    source: Arc<dyn EventSource>,
    projections: HashMap<String, ProjectionSlot>,
}

impl ProjectionRegistry {
    /// Creates a registry rooted at `dir` (created if missing), reading
    /// events from `source`.
    pub fn new(dir: impl Into<PathBuf>, source: Arc<dyn EventSource>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(breccia_store::StoreError::Io)?;
        Ok(Self {
            dir,
            source,
            projections: HashMap::new(),
        })
    }

    /// Registers a projection, opening (or creating) its table file.
    ///
    /// The table's persisted state (rows and checkpoint) survives
    /// restarts; registration only wires it up.
    pub fn register(
        &mut self,
        name: &str,
        schema: Schema,
        options: ProjectionOptions,
    ) -> Result<()> {
        if self.projections.contains_key(name) {
            return Err(ProjectionError::AlreadyExists(name.to_string()));
        }
        let table = TableStore::open(&self.dir, name, schema)?;
        tracing::info!(
            projection = name,
            checkpoint = ?table.checkpoint(),
            "projection registered"
        );
        self.projections.insert(
            name.to_string(),
            ProjectionSlot {
                table: Arc::new(Mutex::new(table)),
                options,
                worker: None,
            },
        );
        Ok(())
    }

    /// Names of all registered projections.
    pub fn projection_names(&self) -> Vec<&str> {
        self.projections.keys().map(String::as_str).collect()
    }

    fn slot(&self, name: &str) -> Result<&ProjectionSlot> {
        self.projections
            .get(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut ProjectionSlot> {
        self.projections
            .get_mut(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }

    // ------------------------------------------------------------------
    // Worker mode
    // ------------------------------------------------------------------

    /// Starts the worker thread for a projection.
    pub fn start(&mut self, name: &str, handler: Box<dyn ProjectionHandler>) -> Result<()> {
        let source = Arc::clone(&self.source);
        let slot = self.slot_mut(name)?;
        if slot.worker_active() {
            return Err(ProjectionError::WorkerActive(name.to_string()));
        }

        let handle = spawn_worker(
            name.to_string(),
            slot.options.clone(),
            handler,
            source,
            Arc::clone(&slot.table),
        )
        .map_err(breccia_store::StoreError::Io)?;
        slot.worker = Some(handle);
        Ok(())
    }

    /// Signals a projection's worker to stop and joins it. A no-op if no
    /// worker is running.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let slot = self.slot_mut(name)?;
        if let Some(mut worker) = slot.worker.take() {
            worker.stop();
        }
        Ok(())
    }

    /// Stops every running worker.
    pub fn stop_all(&mut self) {
        for slot in self.projections.values_mut() {
            if let Some(mut worker) = slot.worker.take() {
                worker.stop();
            }
        }
    }

    /// `true` while the projection's worker thread runs.
    pub fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.slot(name)?.worker_active())
    }

    /// `true` if the projection's worker stopped in the Failed state.
    pub fn is_failed(&self, name: &str) -> Result<bool> {
        Ok(self
            .slot(name)?
            .worker
            .as_ref()
            .is_some_and(|w| w.is_failed()))
    }

    // ------------------------------------------------------------------
    // Poll mode
    // ------------------------------------------------------------------

    /// Fetches the next batch for an embedder-driven projection.
    ///
    /// Returns `None` when the projection is caught up with the log.
    /// Fails with [`ProjectionError::WorkerActive`] while a worker owns
    /// the projection.
    pub fn get_events(&self, name: &str, batch_size: usize) -> Result<Option<EventBatch>> {
        let slot = self.slot(name)?;
        if slot.worker_active() {
            return Err(ProjectionError::WorkerActive(name.to_string()));
        }

        let from = {
            let table = slot.table.lock().expect("table lock poisoned");
            table.checkpoint().map_or(GlobalPos::FIRST, GlobalPos::next)
        };
        let events = self.source.read_global(from, batch_size)?;
        if events.is_empty() {
            return Ok(None);
        }

        let last_global_pos = events.last().expect("non-empty batch").global_pos;
        Ok(Some(EventBatch {
            projection_name: name.to_string(),
            events,
            last_global_pos,
        }))
    }

    /// Applies an embedder-computed batch: ops grouped by tenant plus the
    /// checkpoint advance, atomically.
    pub fn apply_batch(
        &self,
        name: &str,
        groups: Vec<(TenantId, Vec<TableOp>)>,
        last_global_pos: GlobalPos,
    ) -> Result<()> {
        let slot = self.slot(name)?;
        if slot.worker_active() {
            return Err(ProjectionError::WorkerActive(name.to_string()));
        }
        let mut table = slot.table.lock().expect("table lock poisoned");
        table.apply_grouped(groups, last_global_pos)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads and erasure
    // ------------------------------------------------------------------

    /// The projection's durable checkpoint, if it has applied anything.
    pub fn checkpoint(&self, name: &str) -> Result<Option<GlobalPos>> {
        let slot = self.slot(name)?;
        let table = slot.table.lock().expect("table lock poisoned");
        Ok(table.checkpoint())
    }

    /// Reads one row under a tenant.
    pub fn read_row(&self, name: &str, tenant_id: &TenantId, key: &Value) -> Result<Option<Row>> {
        let slot = self.slot(name)?;
        let table = slot.table.lock().expect("table lock poisoned");
        Ok(table.read_row(tenant_id, key))
    }

    /// Erases every row of one tenant from one projection. Returns the
    /// number of rows removed.
    pub fn delete_tenant(&self, name: &str, tenant_id: &TenantId) -> Result<u64> {
        let slot = self.slot(name)?;
        let mut table = slot.table.lock().expect("table lock poisoned");
        Ok(table.delete_tenant(tenant_id)?)
    }
}
