//! Staged state for a group-commit drain.
//!
//! While the writer drains pending requests, every command is validated
//! against committed state *plus* the effects of the commands validated
//! earlier in the same drain — two appends to one stream in one drain must
//! chain, not conflict. [`Staged`] is that overlay: reads fall through to
//! the base view, writes stay local until the drain's fsync returns, after
//! which [`Staged::into_parts`] hands everything to [`State::absorb`]. A
//! failed drain simply drops the overlay.
//!
//! `Staged` is generic over its base view, and is itself a
//! [`StateView`]: an atomic multi-command request stages into its own
//! overlay on top of the drain's overlay, and merges only if every one of
//! its commands passed.

use std::collections::HashMap;

use breccia_types::{CommandId, GlobalPos, StreamId};

use crate::state::{CommandRecord, StagedParts, State, StateView, StreamState};

/// Batch-local overlay over a base state view.
#[derive(Debug)]
pub struct Staged<'a, B: StateView + ?Sized = State> {
    base: &'a B,
    streams: HashMap<StreamId, StreamState>,
    commands: HashMap<(StreamId, CommandId), CommandRecord>,
    /// Append order of touched streams, with their new positions.
    appended: Vec<(StreamId, Vec<GlobalPos>)>,
    next_pos: u64,
}

impl<B: StateView + ?Sized> StateView for Staged<'_, B> {
    fn stream(&self, stream_id: &StreamId) -> Option<&StreamState> {
        self.streams
            .get(stream_id)
            .or_else(|| self.base.stream(stream_id))
    }

    fn command(&self, stream_id: &StreamId, command_id: &CommandId) -> Option<&CommandRecord> {
        self.commands
            .get(&(stream_id.clone(), command_id.clone()))
            .or_else(|| self.base.command(stream_id, command_id))
    }

    fn next_pos(&self) -> u64 {
        self.next_pos
    }
}

impl<'a, B: StateView + ?Sized> Staged<'a, B> {
    /// Creates an empty overlay over `base`.
    pub fn new(base: &'a B) -> Self {
        let next_pos = base.next_pos();
        Self {
            base,
            streams: HashMap::new(),
            commands: HashMap::new(),
            appended: Vec::new(),
            next_pos,
        }
    }

    /// Records a committed-by-this-drain append.
    pub(crate) fn record_commit(
        &mut self,
        stream_id: StreamId,
        command_id: CommandId,
        stream_state: StreamState,
        record: CommandRecord,
        positions: Vec<GlobalPos>,
    ) {
        debug_assert_eq!(
            positions.last().map(|p| p.as_u64()),
            Some(record.result.last_pos.as_u64()),
            "positions must end at the command's last position"
        );
        self.next_pos = record.result.last_pos.as_u64() + 1;
        self.streams.insert(stream_id.clone(), stream_state);
        self.commands
            .insert((stream_id.clone(), command_id), record);
        self.appended.push((stream_id, positions));
    }

    /// Merges a child overlay's parts into this one.
    ///
    /// Used for atomic multi-command requests: the child staged every
    /// command or none; on success its effects become part of the drain.
    pub fn merge(&mut self, parts: StagedParts) {
        debug_assert!(
            parts.next_pos >= self.next_pos,
            "merged next_pos must not move backwards"
        );
        for (stream_id, stream_state) in parts.streams {
            self.streams.insert(stream_id, stream_state);
        }
        for (key, record) in parts.commands {
            self.commands.insert(key, record);
        }
        self.appended.extend(parts.appended);
        self.next_pos = parts.next_pos;
    }

    /// `true` if no command in the drain committed anything.
    pub fn is_empty(&self) -> bool {
        self.appended.is_empty()
    }

    /// Consumes the overlay into parts for [`State::absorb`] (or for
    /// [`Staged::merge`] into a parent overlay).
    pub fn into_parts(self) -> StagedParts {
        StagedParts {
            streams: self.streams,
            commands: self.commands,
            appended: self.appended,
            next_pos: self.next_pos,
        }
    }
}
