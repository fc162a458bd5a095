//! The projection worker: one thread per projection, batches in global
//! order, exactly-once committed effect.
//!
//! # State machine
//!
//! ```text
//! Idle ──tick──▶ Fetching ──empty──▶ Idle (poll delay)
//!                    │ events
//!                    ▼
//!                Applying ──handler error──▶ ErrorDecision
//!                    │ all staged                │ skip/retry → Applying
//!                    ▼                           │ stop / 2nd failure
//!               Committing ──store error──▶ Failed
//!                    │ committed
//!                    ▼
//!                  Idle
//! ```
//!
//! The staged view is snapshotted before every event; `skip` and `retry`
//! rewind it, so a failing event never leaks partial ops. At most one
//! batch is in flight; the commit (ops + checkpoint) is a single store
//! transaction. Stopping aborts the current batch before commit, which is
//! safe — no progress is recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use breccia_store::{TableOp, TableStore};
use breccia_types::{Event, GlobalPos, TenantId};

use crate::handler::{ErrorAction, ProjectionHandler, ProjectionOptions};
use crate::staged::{StagedTable, StagedView};
use crate::EventSource;

/// Control handle for a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// `true` while the worker thread is running.
    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// `true` if the worker entered the Failed state.
    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Signals the worker to stop and joins it.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the worker thread for one projection.
pub(crate) fn spawn_worker(
    name: String,
    options: ProjectionOptions,
    handler: Box<dyn ProjectionHandler>,
    source: Arc<dyn EventSource>,
    table: Arc<Mutex<TableStore>>,
) -> std::io::Result<WorkerHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(AtomicBool::new(false));

    let thread = {
        let stop = Arc::clone(&stop);
        let failed = Arc::clone(&failed);
        std::thread::Builder::new()
            .name(format!("breccia-proj-{name}"))
            .spawn(move || {
                run_worker(&name, options, handler, source, table, &stop, &failed);
            })?
    };

    Ok(WorkerHandle {
        stop,
        failed,
        thread: Some(thread),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Fetching,
    Applying,
    Committing,
    Failed,
}

fn transition(name: &str, state: &mut WorkerState, next: WorkerState) {
    if *state != next {
        tracing::trace!(projection = name, from = ?*state, to = ?next, "worker transition");
        *state = next;
    }
}

fn run_worker(
    name: &str,
    options: ProjectionOptions,
    mut handler: Box<dyn ProjectionHandler>,
    source: Arc<dyn EventSource>,
    table: Arc<Mutex<TableStore>>,
    stop: &AtomicBool,
    failed: &AtomicBool,
) {
    tracing::info!(projection = name, "projection worker started");
    let mut state = WorkerState::Idle;

    while !stop.load(Ordering::SeqCst) {
        transition(name, &mut state, WorkerState::Fetching);

        let from = {
            let guard = table.lock().expect("table lock poisoned");
            guard
                .checkpoint()
                .map_or(GlobalPos::FIRST, GlobalPos::next)
        };

        let events = match source.read_global(from, options.batch_size) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(projection = name, error = %e, "event fetch failed");
                transition(name, &mut state, WorkerState::Failed);
                break;
            }
        };

        if events.is_empty() {
            transition(name, &mut state, WorkerState::Idle);
            std::thread::sleep(options.poll_interval);
            continue;
        }

        transition(name, &mut state, WorkerState::Applying);
        let mut guard = table.lock().expect("table lock poisoned");

        let staged = match stage_batch(name, handler.as_mut(), &events, &guard, stop) {
            BatchStaging::Aborted => break, // stop requested; nothing committed
            BatchStaging::Stopped => {
                transition(name, &mut state, WorkerState::Failed);
                break;
            }
            BatchStaging::Staged(views) => views,
        };

        if options.check_determinism {
            let rerun = match stage_batch(name, handler.as_mut(), &events, &guard, stop) {
                BatchStaging::Aborted => break,
                BatchStaging::Stopped => {
                    transition(name, &mut state, WorkerState::Failed);
                    break;
                }
                BatchStaging::Staged(views) => views,
            };
            if !same_ops(&staged, &rerun) {
                tracing::error!(
                    projection = name,
                    first_pos = %events[0].global_pos,
                    last_pos = %events[events.len() - 1].global_pos,
                    "handler is non-deterministic: repeated batch produced different ops"
                );
                transition(name, &mut state, WorkerState::Failed);
                break;
            }
        }

        transition(name, &mut state, WorkerState::Committing);
        let last_pos = events.last().expect("batch was non-empty").global_pos;
        let groups = into_groups(staged);
        if let Err(e) = guard.apply_grouped(groups, last_pos) {
            tracing::error!(
                projection = name,
                checkpoint = %last_pos,
                error = %e,
                "commit failed, no progress recorded"
            );
            transition(name, &mut state, WorkerState::Failed);
            break;
        }
        drop(guard);

        tracing::debug!(projection = name, checkpoint = %last_pos, events = events.len(), "batch committed");
        transition(name, &mut state, WorkerState::Idle);
    }

    if state == WorkerState::Failed {
        failed.store(true, Ordering::SeqCst);
        tracing::error!(projection = name, "projection worker failed; restart to resume");
    } else {
        tracing::info!(projection = name, "projection worker stopped");
    }
}

enum BatchStaging {
    /// Stop flag observed mid-batch; abort without commit.
    Aborted,
    /// Handler error escalated to a stop verdict.
    Stopped,
    /// All events staged.
    Staged(HashMap<TenantId, StagedView>),
}

fn stage_batch(
    name: &str,
    handler: &mut dyn ProjectionHandler,
    events: &[Event],
    table: &TableStore,
    stop: &AtomicBool,
) -> BatchStaging {
    let mut views: HashMap<TenantId, StagedView> = HashMap::new();

    for event in events {
        if stop.load(Ordering::SeqCst) {
            return BatchStaging::Aborted;
        }
        if !handler.filter(event) {
            continue;
        }

        let tenant_id = handler.tenant_of(event);
        let view = views.entry(tenant_id.clone()).or_default();
        let snapshot = view.snapshot();

        let result = {
            let mut staged = StagedTable::new(&tenant_id, table, view);
            handler.apply(event, &mut staged)
        };

        let Err(error) = result else {
            continue;
        };

        match handler.on_error(&error, event) {
            ErrorAction::Skip => {
                view.restore(snapshot);
                tracing::warn!(
                    projection = name,
                    global_pos = %event.global_pos,
                    error = %error,
                    "handler error skipped"
                );
            }
            ErrorAction::Retry => {
                // Re-seed the staged view before the retry; the failed
                // attempt may have buffered partial ops.
                view.restore(snapshot);
                let retry_snapshot = view.snapshot();
                let retried = {
                    let mut staged = StagedTable::new(&tenant_id, table, view);
                    handler.apply(event, &mut staged)
                };
                if let Err(retry_error) = retried {
                    view.restore(retry_snapshot);
                    tracing::error!(
                        projection = name,
                        global_pos = %event.global_pos,
                        error = %retry_error,
                        "handler retry failed, stopping worker"
                    );
                    return BatchStaging::Stopped;
                }
            }
            ErrorAction::Stop => {
                tracing::error!(
                    projection = name,
                    global_pos = %event.global_pos,
                    error = %error,
                    "handler requested stop"
                );
                return BatchStaging::Stopped;
            }
        }
    }

    BatchStaging::Staged(views)
}

fn same_ops(a: &HashMap<TenantId, StagedView>, b: &HashMap<TenantId, StagedView>) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .all(|(tenant, view)| b.get(tenant).is_some_and(|other| view.ops() == other.ops()))
}

/// Flushes staged views into tenant-ordered groups for the atomic commit.
fn into_groups(views: HashMap<TenantId, StagedView>) -> Vec<(TenantId, Vec<TableOp>)> {
    let mut groups: Vec<(TenantId, Vec<TableOp>)> = views
        .into_iter()
        .filter(|(_, view)| !view.is_empty())
        .map(|(tenant, view)| (tenant, view.into_ops()))
        .collect();
    groups.sort_by(|(a, _), (b, _)| a.cmp(b));
    groups
}
