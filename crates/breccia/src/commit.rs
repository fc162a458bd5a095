//! Group-commit queue and the writer thread.
//!
//! All appends funnel through one queue. The single writer thread drains
//! every pending request in one pass, so callers that arrived while the
//! previous fsync was in flight coalesce into a single `write` + `fsync`.
//! It then validates each request through the pure kernel, serializes the
//! survivors, persists them, and only after the fsync returns publishes
//! the new state and answers the callers. Validation failures are answered
//! immediately and contribute no bytes.
//!
//! A write or fsync failure is environmental: every caller of the failed
//! drain gets the error, the store flips to unhealthy, and all future
//! appends fail fast until the process reopens the store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use breccia_kernel::{apply_append, Outcome, Staged, State};
use breccia_storage::{CommitBuffer, EventLog};
use breccia_types::{
    AppendCommand, AppendResult, Event, GlobalPos, TenantId, Timestamp,
};

use crate::error::{is_disk_full, Error, Result};

/// Upper bound on requests drained into one fsync.
const MAX_DRAIN: usize = 128;

/// Initial capacity of the serialization buffer.
const COMMIT_BUFFER_CAPACITY: usize = 256 * 1024;

/// One append request in flight through the queue.
pub(crate) struct WriteJob {
    /// The commands of this request; committed all-or-nothing.
    pub commands: Vec<AppendCommand>,
    /// Tenant presented by the caller.
    pub tenant_id: TenantId,
    /// Where the caller waits for its answer.
    pub reply: SyncSender<Result<Vec<AppendResult>>>,
}

/// State shared between the facade, the writer thread, and readers.
pub(crate) struct Shared {
    /// Committed kernel state (stream index + idempotency index).
    pub state: RwLock<State>,
    /// Published durable head; 0 means the log is empty.
    pub head: AtomicU64,
    /// Set on the first environmental commit failure.
    pub unhealthy: AtomicBool,
    /// The group-commit queue.
    pub queue: CommitQueue,
}

impl Shared {
    /// The published durable head.
    pub fn head_pos(&self) -> Option<GlobalPos> {
        let head = self.head.load(Ordering::Acquire);
        (head > 0).then(|| GlobalPos::new(head))
    }
}

/// FIFO of pending append requests, drained by the writer thread.
pub(crate) struct CommitQueue {
    jobs: Mutex<VecDeque<WriteJob>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl CommitQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueues a job. Returns `false` after shutdown.
    ///
    /// The shutdown check happens under the jobs lock: a job either lands
    /// before the writer's final drain and gets answered, or is refused.
    pub fn submit(&self, job: WriteJob) -> bool {
        let mut jobs = self.jobs.lock().expect("commit queue lock poisoned");
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        jobs.push_back(job);
        self.available.notify_one();
        true
    }

    /// Stops the queue and wakes the writer so it can drain and exit.
    pub fn shutdown(&self) {
        let _jobs = self.jobs.lock().expect("commit queue lock poisoned");
        self.shutdown.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }

    /// Blocks until jobs are available, then drains up to `max` of them.
    /// Returns `None` once shut down and empty.
    fn wait_drain(&self, max: usize) -> Option<Vec<WriteJob>> {
        let mut jobs = self.jobs.lock().expect("commit queue lock poisoned");
        loop {
            if !jobs.is_empty() {
                let take = jobs.len().min(max);
                return Some(jobs.drain(..take).collect());
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            jobs = self
                .available
                .wait(jobs)
                .expect("commit queue lock poisoned");
        }
    }
}

/// The writer thread body. Owns the event log for the life of the store.
pub(crate) fn run_writer(mut log: EventLog, shared: Arc<Shared>) {
    let mut buffer = CommitBuffer::new(COMMIT_BUFFER_CAPACITY);

    while let Some(jobs) = shared.queue.wait_drain(MAX_DRAIN) {
        if shared.unhealthy.load(Ordering::SeqCst) {
            for job in jobs {
                let _ = job.reply.send(Err(Error::StoreUnhealthy));
            }
            continue;
        }
        process_drain(&mut log, &shared, &mut buffer, jobs);
    }

    tracing::info!("commit writer thread exiting");
}

fn process_drain(
    log: &mut EventLog,
    shared: &Shared,
    buffer: &mut CommitBuffer,
    jobs: Vec<WriteJob>,
) {
    let timestamp = Timestamp::now();
    buffer.begin(log.base_offset());

    let mut entries: Vec<(GlobalPos, u64)> = Vec::new();
    let mut successes: Vec<(SyncSender<Result<Vec<AppendResult>>>, Vec<AppendResult>)> =
        Vec::new();

    // Validate against committed state + earlier requests of this drain.
    // The read lock covers pure validation only; no I/O happens under it.
    let parts = {
        let state = shared.state.read().expect("state lock poisoned");
        let mut staged = Staged::new(&*state);

        for job in jobs {
            match stage_job(&mut staged, &job, timestamp, buffer, &mut entries) {
                Ok(results) => successes.push((job.reply, results)),
                Err(err) => {
                    // User error: answered now, no bytes contributed.
                    let _ = job.reply.send(Err(err));
                }
            }
        }
        staged.into_parts()
    };

    if buffer.is_empty() {
        // Only idempotent replays or rejections: nothing to persist.
        for (reply, results) in successes {
            let _ = reply.send(Ok(results));
        }
        return;
    }

    match log.append(buffer.bytes(), &entries) {
        Ok(()) => {
            let next_pos = parts.next_pos;
            shared
                .state
                .write()
                .expect("state lock poisoned")
                .absorb(parts);
            // Readers observe the new head only after state is published.
            shared.head.store(next_pos - 1, Ordering::Release);

            for (reply, results) in successes {
                let _ = reply.send(Ok(results));
            }
        }
        Err(e) => {
            shared.unhealthy.store(true, Ordering::SeqCst);
            tracing::error!(error = %e, "commit write failed; store quiesced until reopen");
            for (reply, _) in successes {
                let _ = reply.send(Err(classify_commit_failure(&e)));
            }
        }
    }
}

/// Stages one request's commands atomically: a nested overlay collects the
/// whole request, and only a fully valid request merges into the drain and
/// serializes its batches.
fn stage_job(
    staged: &mut Staged<'_, State>,
    job: &WriteJob,
    timestamp: Timestamp,
    buffer: &mut CommitBuffer,
    entries: &mut Vec<(GlobalPos, u64)>,
) -> Result<Vec<AppendResult>> {
    let mut results = Vec::with_capacity(job.commands.len());
    let mut batches: Vec<Vec<Event>> = Vec::new();

    let parts = {
        let mut job_staged = Staged::new(&*staged);
        for cmd in &job.commands {
            match apply_append(&mut job_staged, cmd, &job.tenant_id, timestamp)? {
                Outcome::Committed(committed) => {
                    results.push(committed.result);
                    batches.push(committed.events);
                }
                Outcome::Idempotent(result) => results.push(result),
            }
        }
        job_staged.into_parts()
    };
    staged.merge(parts);

    for events in &batches {
        entries.extend(buffer.push_batch(events, timestamp));
    }

    Ok(results)
}

/// Maps an environmental commit failure onto the caller-facing taxonomy.
/// Each caller gets its own error value.
fn classify_commit_failure(e: &breccia_storage::StorageError) -> Error {
    match e {
        breccia_storage::StorageError::Io(io) if is_disk_full(io) => Error::StorageFull,
        breccia_storage::StorageError::Io(io) => {
            Error::Io(std::io::Error::new(io.kind(), io.to_string()))
        }
        other => Error::Io(std::io::Error::other(other.to_string())),
    }
}
