//! State reconstruction from the recovered log.
//!
//! The kernel state is never persisted; on open, the storage layer replays
//! every durable event in global order and [`Replayer`] folds them back
//! into a [`State`]: stream heads, locator lists, and the idempotency
//! index. Events of one command are contiguous in global order, so command
//! records are rebuilt by watching for the `(stream, command)` key to
//! change.

use std::collections::HashMap;

use breccia_crypto::Crc32c;
use breccia_types::{AppendResult, CommandId, Event, GlobalPos, StreamId, StreamRev};

use crate::state::{CommandRecord, State, StateView};

struct PendingCommand {
    stream_id: StreamId,
    command_id: CommandId,
    first_pos: GlobalPos,
    last_pos: GlobalPos,
    first_rev: StreamRev,
    last_rev: StreamRev,
    hasher: Crc32c,
}

/// Folds replayed events into a fresh [`State`].
pub struct Replayer {
    state: State,
    /// Full locator map during replay; trimmed into the bounded cache at
    /// the end.
    locators: HashMap<StreamId, Vec<GlobalPos>>,
    pending: Option<PendingCommand>,
}

impl Replayer {
    /// Creates a replayer with the given locator cache capacity.
    pub fn new(locator_capacity: usize) -> Self {
        Self {
            state: State::with_locator_capacity(locator_capacity),
            locators: HashMap::new(),
            pending: None,
        }
    }

    /// Observes one durable event. Must be called in global order.
    pub fn observe(&mut self, event: &Event) {
        assert_eq!(
            event.global_pos.as_u64(),
            self.state.next_pos(),
            "replay must be gapless"
        );

        self.state.replay_stream_event(
            &event.stream_id,
            &event.tenant_id,
            event.stream_rev,
            event.global_pos,
        );
        self.locators
            .entry(event.stream_id.clone())
            .or_default()
            .push(event.global_pos);

        let same_command = self.pending.as_ref().is_some_and(|p| {
            p.stream_id == event.stream_id && p.command_id == event.command_id
        });

        if same_command {
            let pending = self.pending.as_mut().expect("pending command checked");
            pending.last_pos = event.global_pos;
            pending.last_rev = event.stream_rev;
            pending
                .hasher
                .update(&(event.payload.len() as u32).to_le_bytes());
            pending.hasher.update(&event.payload);
        } else {
            self.flush_pending();
            let mut hasher = Crc32c::new();
            hasher.update(&(event.payload.len() as u32).to_le_bytes());
            hasher.update(&event.payload);
            self.pending = Some(PendingCommand {
                stream_id: event.stream_id.clone(),
                command_id: event.command_id.clone(),
                first_pos: event.global_pos,
                last_pos: event.global_pos,
                first_rev: event.stream_rev,
                last_rev: event.stream_rev,
                hasher,
            });
        }
    }

    fn flush_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            let record = CommandRecord {
                result: AppendResult {
                    first_rev: pending.first_rev,
                    last_rev: pending.last_rev,
                    first_pos: pending.first_pos,
                    last_pos: pending.last_pos,
                },
                payload_crc: pending.hasher.finalize(),
            };
            self.state
                .replay_command(pending.stream_id, pending.command_id, record);
        }
    }

    /// Finishes the replay and returns the rebuilt state.
    pub fn finish(mut self) -> State {
        self.flush_pending();
        for (stream_id, positions) in self.locators {
            self.state.replay_locators(stream_id, positions);
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::payload_set_crc;
    use breccia_types::{TenantId, Timestamp};
    use bytes::Bytes;

    fn event(pos: u64, stream: &str, rev: u64, cmd: &str, payload: &str) -> Event {
        Event {
            global_pos: GlobalPos::new(pos),
            stream_id: StreamId::new(stream),
            stream_rev: StreamRev::new(rev),
            tenant_id: TenantId::new("t"),
            command_id: CommandId::new(cmd),
            timestamp: Timestamp::from_millis(0),
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[test]
    fn rebuilds_streams_and_commands() {
        let mut replayer = Replayer::new(16);
        replayer.observe(&event(1, "a", 1, "c-1", "x"));
        replayer.observe(&event(2, "a", 2, "c-1", "y"));
        replayer.observe(&event(3, "b", 1, "c-2", "z"));

        let mut state = replayer.finish();
        assert_eq!(state.next_pos(), 4);
        assert_eq!(
            state.stream(&StreamId::new("a")).unwrap().current_rev,
            StreamRev::new(2)
        );

        let record = state
            .command(&StreamId::new("a"), &CommandId::new("c-1"))
            .unwrap();
        assert_eq!(record.result.first_pos, GlobalPos::new(1));
        assert_eq!(record.result.last_pos, GlobalPos::new(2));
        assert_eq!(record.result.last_rev, StreamRev::new(2));
        // Matches the crc the kernel would compute for the same payloads.
        assert_eq!(
            record.payload_crc,
            payload_set_crc([b"x".as_slice(), b"y".as_slice()])
        );

        assert_eq!(
            state.locators(&StreamId::new("a")).unwrap(),
            &vec![GlobalPos::new(1), GlobalPos::new(2)]
        );
        assert_eq!(state.head(), Some(GlobalPos::new(3)));
    }

    #[test]
    fn same_command_id_across_streams_stays_separate() {
        let mut replayer = Replayer::new(16);
        replayer.observe(&event(1, "a", 1, "shared", "x"));
        replayer.observe(&event(2, "b", 1, "shared", "y"));

        let state = replayer.finish();
        let a = state
            .command(&StreamId::new("a"), &CommandId::new("shared"))
            .unwrap();
        let b = state
            .command(&StreamId::new("b"), &CommandId::new("shared"))
            .unwrap();
        assert_eq!(a.result.first_pos, GlobalPos::new(1));
        assert_eq!(b.result.first_pos, GlobalPos::new(2));
    }

    #[test]
    #[should_panic(expected = "gapless")]
    fn gap_in_replay_panics() {
        let mut replayer = Replayer::new(16);
        replayer.observe(&event(2, "a", 1, "c", "x"));
    }
}
