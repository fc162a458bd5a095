//! The `Breccia` store handle.
//!
//! `Breccia::open` recovers the log, rebuilds the in-memory indexes, and
//! spawns the store's background workers: the group-commit writer thread
//! and the admission tick. Everything the store owns is torn down by
//! [`Breccia::close`] (or `Drop`).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use breccia_kernel::{Replayer, StateView};
use breccia_projections::{
    EventBatch, EventSource, ProjectionHandler, ProjectionOptions, ProjectionRegistry,
};
use breccia_storage::{EventLog, LogConfig, LogReader};
use breccia_store::{Row, Schema, TableOp, Value};
use breccia_types::{
    AppendCommand, AppendResult, Event, ExpectedRevision, GlobalPos, StreamId, StreamRev,
    TenantId, DEFAULT_MAX_PAYLOAD_BYTES,
};

use crate::admission::{AdmissionConfig, AdmissionController, MetricsSnapshot};
use crate::commit::{run_writer, CommitQueue, Shared, WriteJob};
use crate::error::{projection_error, Error, Result};

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Segment size cap before rotation.
    pub max_segment_bytes: u64,
    /// Per-event payload cap.
    pub max_payload_bytes: usize,
    /// Number of streams whose locator lists stay resident.
    pub locator_cache_streams: usize,
    /// Admission controller tuning.
    pub admission: AdmissionConfig,
}

impl StoreConfig {
    /// Creates a configuration with defaults for the given directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_segment_bytes: breccia_storage::DEFAULT_MAX_SEGMENT_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            locator_cache_streams: breccia_kernel::state::DEFAULT_LOCATOR_CACHE_STREAMS,
            admission: AdmissionConfig::default(),
        }
    }

    /// Sets the segment size cap.
    pub fn with_max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets the payload cap.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Sets the admission controller tuning.
    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }
}

/// Adapter giving projection workers read access to the log.
struct LogSource {
    reader: LogReader,
    shared: Arc<Shared>,
}

impl EventSource for LogSource {
    fn read_global(
        &self,
        from: GlobalPos,
        max_count: usize,
    ) -> breccia_projections::Result<Vec<Event>> {
        self.reader
            .read_global(from, max_count, self.shared.head_pos())
            .map_err(|e| breccia_projections::ProjectionError::Source(e.to_string()))
    }
}

/// An embedded, append-only, tenant-isolated event store.
///
/// # Example
///
/// ```no_run
/// use breccia::{Breccia, ExpectedRevision, EventData, TenantId};
///
/// let store = Breccia::open("./data")?;
/// let result = store.append(
///     "user-1",
///     "cmd-A",
///     ExpectedRevision::NoStream,
///     vec![EventData::new(&b"{\"hello\":\"world\"}"[..])],
///     TenantId::new("tenantX"),
/// )?;
/// assert_eq!(result.first_rev.as_u64(), 1);
/// # Ok::<(), breccia::Error>(())
/// ```
pub struct Breccia {
    config: StoreConfig,
    shared: Arc<Shared>,
    reader: LogReader,
    admission: Arc<AdmissionController>,
    projections: Mutex<Option<ProjectionRegistry>>,
    writer: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    ticker_stop: Arc<AtomicBool>,
}

impl Breccia {
    /// Opens a store at `path` with default configuration.
    ///
    /// Creates the directory layout if missing; otherwise runs crash
    /// recovery and rebuilds the in-memory indexes from the log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(path.as_ref()))
    }

    /// Opens a store with explicit configuration.
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let mut replayer = Replayer::new(config.locator_cache_streams);
        let log = EventLog::open(
            config.data_dir.join("events"),
            LogConfig {
                max_segment_bytes: config.max_segment_bytes,
            },
            &mut |event| replayer.observe(&event),
        )
        .map_err(Error::from)?;
        let state = replayer.finish();
        let head = state.head().map_or(0, GlobalPos::as_u64);

        tracing::info!(
            data_dir = %config.data_dir.display(),
            streams = state.stream_count(),
            head,
            "store opened"
        );

        let reader = log.reader();
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            head: AtomicU64::new(head),
            unhealthy: AtomicBool::new(false),
            queue: CommitQueue::new(),
        });

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("breccia-writer".to_string())
                .spawn(move || run_writer(log, shared))?
        };

        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let admission = Arc::clone(&admission);
            let stop = Arc::clone(&ticker_stop);
            let interval = config.admission.tick_interval;
            std::thread::Builder::new()
                .name("breccia-admission".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::sleep(interval);
                        admission.evaluate();
                    }
                })?
        };

        Ok(Self {
            config,
            shared,
            reader,
            admission,
            projections: Mutex::new(None),
            writer: Some(writer),
            ticker: Some(ticker),
            ticker_stop,
        })
    }

    // ==================================================================
    // Write path
    // ==================================================================

    /// Appends events to one stream.
    ///
    /// Durable and visible on return; on any error nothing of the call is
    /// visible. Repeating a command id with the identical payload set
    /// returns the original result without appending.
    pub fn append(
        &self,
        stream_id: impl Into<StreamId>,
        command_id: impl Into<breccia_types::CommandId>,
        expected: ExpectedRevision,
        events: Vec<breccia_types::EventData>,
        tenant_id: TenantId,
    ) -> Result<AppendResult> {
        let command = AppendCommand::new(command_id.into(), stream_id.into(), expected, events);
        let mut results = self.append_batch(vec![command], tenant_id)?;
        Ok(results.pop().expect("one command yields one result"))
    }

    /// Appends across multiple streams atomically: either every command
    /// commits or none does, and their positions are contiguous in command
    /// order.
    pub fn append_batch(
        &self,
        commands: Vec<AppendCommand>,
        tenant_id: TenantId,
    ) -> Result<Vec<AppendResult>> {
        if self.shared.unhealthy.load(Ordering::SeqCst) {
            return Err(Error::StoreUnhealthy);
        }
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        for command in &commands {
            for event in &command.events {
                if event.payload.len() > self.config.max_payload_bytes {
                    return Err(Error::PayloadTooLarge {
                        size: event.payload.len(),
                        max: self.config.max_payload_bytes,
                    });
                }
            }
        }

        if !self.admission.try_acquire() {
            return Err(Error::Overloaded);
        }
        let started = Instant::now();

        let (reply, response) = sync_channel(1);
        let submitted = self.shared.queue.submit(WriteJob {
            commands,
            tenant_id,
            reply,
        });
        if !submitted {
            self.admission.release();
            return Err(Error::StoreUnhealthy);
        }

        // No cancellation past this point: the batch may already be
        // durable even if the caller stops waiting.
        match response.recv() {
            Ok(Ok(results)) => {
                self.admission.complete(started.elapsed());
                Ok(results)
            }
            Ok(Err(error)) => {
                self.admission.release();
                Err(error)
            }
            Err(_) => {
                self.admission.release();
                Err(Error::StoreUnhealthy)
            }
        }
    }

    // ==================================================================
    // Read path
    // ==================================================================

    /// Reads events of one stream in revision order, starting at
    /// `from_rev` (0 and 1 both mean the beginning), at most `max_count`.
    pub fn read_stream(
        &self,
        stream_id: impl Into<StreamId>,
        from_rev: u64,
        max_count: usize,
        tenant_id: TenantId,
    ) -> Result<Vec<Event>> {
        let stream_id = stream_id.into();
        let positions = self.stream_positions(&stream_id, &tenant_id, from_rev, max_count)?;
        if positions.is_empty() {
            return Ok(Vec::new());
        }

        let events = self.reader.read_positions(&positions).map_err(Error::from)?;
        for event in &events {
            if !tenant_id.is_system() && event.tenant_id != tenant_id {
                return Err(Error::TenantMismatch);
            }
        }
        Ok(events)
    }

    /// Resolves a stream read to global positions, rebuilding evicted
    /// locator lists from the log when necessary.
    fn stream_positions(
        &self,
        stream_id: &StreamId,
        tenant_id: &TenantId,
        from_rev: u64,
        max_count: usize,
    ) -> Result<Vec<GlobalPos>> {
        let start = from_rev.max(1);

        // The SIEVE cache mutates on access, so locator reads take the
        // write lock; the critical section is a bounds check plus a slice
        // clone.
        {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            let Some(stream) = state.stream(stream_id) else {
                return Err(Error::StreamNotFound(stream_id.clone()));
            };
            if !tenant_id.is_system() && &stream.tenant_id != tenant_id {
                return Err(Error::TenantMismatch);
            }
            let current_rev = stream.current_rev.as_u64();
            if start > current_rev || max_count == 0 {
                return Ok(Vec::new());
            }

            if let Some(locators) = state.locators(stream_id) {
                let lo = (start - 1) as usize;
                let hi = locators.len().min(lo.saturating_add(max_count));
                return Ok(locators[lo..hi].to_vec());
            }
        }

        // Cold stream: rebuild from segment trailers without holding the
        // lock, then install the list if the stream hasn't moved.
        tracing::warn!(stream_id = %stream_id, "locator list evicted, rebuilding from log");
        let head = self.shared.head_pos();
        let positions = self
            .reader
            .scan_stream_positions(stream_id, head)
            .map_err(Error::from)?;

        {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            let still_current = state
                .stream(stream_id)
                .is_some_and(|s| s.current_rev.as_u64() == positions.len() as u64);
            if still_current {
                state.install_locators(stream_id.clone(), positions.clone());
            }
        }

        let lo = ((start - 1) as usize).min(positions.len());
        let hi = positions.len().min(lo.saturating_add(max_count));
        Ok(positions[lo..hi].to_vec())
    }

    /// Reads events in global-position order starting at `from_pos`.
    ///
    /// No tenant filtering: callers of this form are trusted (projection
    /// runtime, operational tooling). Reaching the durable head returns
    /// the partial result.
    pub fn read_global(&self, from_pos: GlobalPos, max_count: usize) -> Result<Vec<Event>> {
        self.reader
            .read_global(from_pos, max_count, self.shared.head_pos())
            .map_err(Error::from)
    }

    /// Returns the current revision of a stream.
    pub fn get_stream_revision(
        &self,
        stream_id: impl Into<StreamId>,
        tenant_id: TenantId,
    ) -> Result<StreamRev> {
        let stream_id = stream_id.into();
        let state = self.shared.state.read().expect("state lock poisoned");
        let Some(stream) = state.stream(&stream_id) else {
            return Err(Error::StreamNotFound(stream_id));
        };
        if !tenant_id.is_system() && stream.tenant_id != tenant_id {
            return Err(Error::TenantMismatch);
        }
        Ok(stream.current_rev)
    }

    /// The durable global head, if any event has committed.
    pub fn global_head(&self) -> Option<GlobalPos> {
        self.shared.head_pos()
    }

    // ==================================================================
    // Admission metrics
    // ==================================================================

    /// Snapshot of the admission controller.
    pub fn admission_metrics(&self) -> MetricsSnapshot {
        self.admission.metrics()
    }

    // ==================================================================
    // Projections
    // ==================================================================

    /// Initializes the projection runtime under `<data_dir>/projections`.
    /// Idempotent.
    pub fn init_projections(&self) -> Result<()> {
        let mut guard = self.projections.lock().expect("projections lock poisoned");
        if guard.is_some() {
            return Ok(());
        }
        let source = Arc::new(LogSource {
            reader: self.reader.clone(),
            shared: Arc::clone(&self.shared),
        });
        let registry =
            ProjectionRegistry::new(self.config.data_dir.join("projections"), source)
                .map_err(|e| projection_error("", e))?;
        *guard = Some(registry);
        Ok(())
    }

    fn with_projections<T>(
        &self,
        f: impl FnOnce(&mut ProjectionRegistry) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.projections.lock().expect("projections lock poisoned");
        let registry = guard.as_mut().ok_or(Error::ProjectionsNotInitialized)?;
        f(registry)
    }

    /// Registers a projection with its table schema and runtime options.
    pub fn register_projection(
        &self,
        name: &str,
        schema: Schema,
        options: ProjectionOptions,
    ) -> Result<()> {
        self.with_projections(|registry| {
            registry
                .register(name, schema, options)
                .map_err(|e| projection_error(name, e))
        })
    }

    /// Starts the worker thread for a projection.
    pub fn start_projection(
        &self,
        name: &str,
        handler: Box<dyn ProjectionHandler>,
    ) -> Result<()> {
        self.with_projections(|registry| {
            registry
                .start(name, handler)
                .map_err(|e| projection_error(name, e))
        })
    }

    /// Stops a projection's worker, finishing or aborting its current
    /// batch (aborting is safe: no progress is recorded).
    pub fn stop_projection(&self, name: &str) -> Result<()> {
        self.with_projections(|registry| {
            registry.stop(name).map_err(|e| projection_error(name, e))
        })
    }

    /// `true` if the projection's worker stopped in the failed state.
    pub fn projection_failed(&self, name: &str) -> Result<bool> {
        self.with_projections(|registry| {
            registry
                .is_failed(name)
                .map_err(|e| projection_error(name, e))
        })
    }

    /// Poll mode: fetches the next batch after the projection's
    /// checkpoint, or `None` when caught up.
    pub fn get_projection_events(
        &self,
        name: &str,
        batch_size: usize,
    ) -> Result<Option<EventBatch>> {
        self.with_projections(|registry| {
            registry
                .get_events(name, batch_size)
                .map_err(|e| projection_error(name, e))
        })
    }

    /// Poll mode: atomically applies ops grouped by tenant and advances
    /// the checkpoint.
    pub fn apply_projection_batch(
        &self,
        name: &str,
        groups: Vec<(TenantId, Vec<TableOp>)>,
        last_global_pos: GlobalPos,
    ) -> Result<()> {
        self.with_projections(|registry| {
            registry
                .apply_batch(name, groups, last_global_pos)
                .map_err(|e| projection_error(name, e))
        })
    }

    /// The projection's durable checkpoint.
    pub fn get_projection_checkpoint(&self, name: &str) -> Result<Option<GlobalPos>> {
        self.with_projections(|registry| {
            registry.checkpoint(name).map_err(|e| projection_error(name, e))
        })
    }

    /// Reads one materialised row under a tenant.
    pub fn read_projection_row(
        &self,
        name: &str,
        tenant_id: &TenantId,
        key: &Value,
    ) -> Result<Option<Row>> {
        self.with_projections(|registry| {
            registry
                .read_row(name, tenant_id, key)
                .map_err(|e| projection_error(name, e))
        })
    }

    /// Erases a tenant's rows from one projection (data-subject erasure).
    /// Returns the number of rows removed.
    pub fn delete_tenant_from_projection(
        &self,
        name: &str,
        tenant_id: &TenantId,
    ) -> Result<u64> {
        self.with_projections(|registry| {
            registry
                .delete_tenant(name, tenant_id)
                .map_err(|e| projection_error(name, e))
        })
    }

    // ==================================================================
    // Lifecycle
    // ==================================================================

    /// Stops projection workers and background threads, flushes, and
    /// joins. The store is unusable afterwards.
    pub fn close(&mut self) {
        if let Some(registry) = self
            .projections
            .lock()
            .expect("projections lock poisoned")
            .as_mut()
        {
            registry.stop_all();
        }

        self.shared.queue.shutdown();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }

        self.ticker_stop.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}

impl Drop for Breccia {
    fn drop(&mut self) {
        self.close();
    }
}
