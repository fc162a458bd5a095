//! Committed in-memory state: stream index and idempotency index.
//!
//! [`State`] mirrors what is durably on disk. It is only ever advanced
//! *after* a batch's fsync has returned, so readers can trust that any
//! stream head or locator they observe refers to durable bytes.
//!
//! Persistence is implicit: the whole state is rebuilt from the log during
//! recovery (see [`crate::replay::Replayer`]). Locator lists for cold
//! streams may be evicted from their bounded cache; they are rebuilt on
//! demand by scanning segment trailers, while the per-stream head state
//! stays resident for every stream.

use std::collections::HashMap;

use breccia_types::{AppendResult, CommandId, GlobalPos, StreamId, StreamRev, TenantId};

use crate::sieve_cache::SieveCache;

/// Default number of streams whose locator lists stay resident.
pub const DEFAULT_LOCATOR_CACHE_STREAMS: usize = 4096;

/// Per-stream head state. Always resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    /// The tenant that owns the stream (set by its first append).
    pub tenant_id: TenantId,
    /// Revision of the stream's last event.
    pub current_rev: StreamRev,
    /// Global position of the stream's last event.
    pub head_pos: GlobalPos,
}

/// Cached outcome of a committed command, for idempotent replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    /// The result originally returned to the caller.
    pub result: AppendResult,
    /// CRC32-C over the command's length-prefixed payload set.
    pub payload_crc: u32,
}

/// Read access to commit-protocol state, committed or staged.
///
/// The kernel validates against this view; [`State`] implements it for the
/// committed baseline and [`crate::staged::Staged`] for overlays, which is
/// what lets an atomic multi-command batch stage into a drain that is
/// itself staged over committed state.
pub trait StateView {
    /// The head state of a stream, if it exists.
    fn stream(&self, stream_id: &StreamId) -> Option<&StreamState>;

    /// The cached record of a committed command.
    fn command(&self, stream_id: &StreamId, command_id: &CommandId) -> Option<&CommandRecord>;

    /// Next global position to assign.
    fn next_pos(&self) -> u64;
}

/// The committed stream index and idempotency index.
#[derive(Debug)]
pub struct State {
    streams: HashMap<StreamId, StreamState>,
    commands: HashMap<(StreamId, CommandId), CommandRecord>,
    /// rev → global position per stream, index `rev - 1`. Bounded; evicted
    /// lists are rebuilt from the log.
    locators: SieveCache<StreamId, Vec<GlobalPos>>,
    /// Next global position to assign.
    next_pos: u64,
}

impl StateView for State {
    fn stream(&self, stream_id: &StreamId) -> Option<&StreamState> {
        self.streams.get(stream_id)
    }

    fn command(&self, stream_id: &StreamId, command_id: &CommandId) -> Option<&CommandRecord> {
        self.commands
            .get(&(stream_id.clone(), command_id.clone()))
    }

    fn next_pos(&self) -> u64 {
        self.next_pos
    }
}

impl State {
    /// Creates an empty state with the default locator cache size.
    pub fn new() -> Self {
        Self::with_locator_capacity(DEFAULT_LOCATOR_CACHE_STREAMS)
    }

    /// Creates an empty state with a custom locator cache size.
    pub fn with_locator_capacity(capacity: usize) -> Self {
        Self {
            streams: HashMap::new(),
            commands: HashMap::new(),
            locators: SieveCache::new(capacity),
            next_pos: GlobalPos::FIRST.as_u64(),
        }
    }

    /// The durable global head, if any event has ever committed.
    pub fn head(&self) -> Option<GlobalPos> {
        (self.next_pos > 1).then(|| GlobalPos::new(self.next_pos - 1))
    }

    /// Number of known streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Returns the resident locator list of a stream, if cached.
    ///
    /// `None` means either the stream is unknown or its list was evicted;
    /// the caller distinguishes the two via [`StateView::stream`] and
    /// rebuilds from the log in the latter case.
    pub fn locators(&mut self, stream_id: &StreamId) -> Option<&Vec<GlobalPos>> {
        self.locators.get(stream_id)
    }

    /// Installs a rebuilt locator list for a stream.
    ///
    /// # Panics
    ///
    /// Panics if the list length disagrees with the stream's current
    /// revision — a rebuilt list must be complete.
    pub fn install_locators(&mut self, stream_id: StreamId, positions: Vec<GlobalPos>) {
        let rev = self
            .streams
            .get(&stream_id)
            .map_or(0, |s| s.current_rev.as_u64());
        assert_eq!(
            positions.len() as u64,
            rev,
            "locator list must cover revisions 1..={rev}"
        );
        self.locators.insert(stream_id, positions);
    }

    /// Absorbs a drained batch's staged results. Called strictly after the
    /// batch's fsync has returned.
    pub fn absorb(&mut self, parts: StagedParts) {
        debug_assert!(
            parts.next_pos >= self.next_pos,
            "staged next_pos must not move backwards"
        );

        for (stream_id, positions) in parts.appended {
            if !self.streams.contains_key(&stream_id) {
                // Brand-new stream: its full history is exactly this batch.
                self.locators.insert(stream_id, positions);
            } else if let Some(list) = self.locators.get_mut(&stream_id) {
                list.extend(positions);
            }
            // Evicted and pre-existing: leave it cold; a rebuild sees the
            // full log anyway.
        }

        for (stream_id, stream_state) in parts.streams {
            self.streams.insert(stream_id, stream_state);
        }
        for (key, record) in parts.commands {
            self.commands.insert(key, record);
        }
        self.next_pos = parts.next_pos;
    }

    // ------------------------------------------------------------------
    // Replay-only mutators (used while rebuilding from the log)
    // ------------------------------------------------------------------

    pub(crate) fn replay_stream_event(
        &mut self,
        stream_id: &StreamId,
        tenant_id: &TenantId,
        rev: StreamRev,
        pos: GlobalPos,
    ) {
        let state = self
            .streams
            .entry(stream_id.clone())
            .or_insert_with(|| StreamState {
                tenant_id: tenant_id.clone(),
                current_rev: StreamRev::new(0),
                head_pos: pos,
            });
        assert_eq!(
            state.current_rev.next(),
            rev,
            "replayed revisions must be contiguous on stream {stream_id}"
        );
        assert_eq!(
            &state.tenant_id, tenant_id,
            "stream {stream_id} changed tenants mid-log"
        );
        state.current_rev = rev;
        state.head_pos = pos;
        self.next_pos = pos.as_u64() + 1;
    }

    pub(crate) fn replay_command(
        &mut self,
        stream_id: StreamId,
        command_id: CommandId,
        record: CommandRecord,
    ) {
        self.commands.insert((stream_id, command_id), record);
    }

    pub(crate) fn replay_locators(&mut self, stream_id: StreamId, positions: Vec<GlobalPos>) {
        self.locators.insert(stream_id, positions);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of a drain, ready to be absorbed into [`State`].
#[derive(Debug)]
pub struct StagedParts {
    /// Final head state per touched stream.
    pub streams: HashMap<StreamId, StreamState>,
    /// Command records created by the drain.
    pub commands: HashMap<(StreamId, CommandId), CommandRecord>,
    /// Positions appended per stream, in revision order.
    pub appended: Vec<(StreamId, Vec<GlobalPos>)>,
    /// Next global position after the drain.
    pub next_pos: u64,
}
