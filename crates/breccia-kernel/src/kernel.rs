//! The commit decision: conflict checks, idempotency, position assignment.
//!
//! [`apply_append`] is the whole of write-path validation, expressed as a
//! pure function over [`Staged`] state. The writer thread calls it for
//! every command of a drain; commands that pass produce fully-positioned
//! [`Event`]s ready for serialization, commands that fail produce typed
//! errors and contribute no bytes.

use breccia_types::{
    AppendCommand, AppendResult, Event, ExpectedRevision, GlobalPos, StreamId, StreamRev,
    TenantId, Timestamp,
};
use thiserror::Error;

use crate::staged::Staged;
use crate::state::{CommandRecord, StateView, StreamState};

/// Validation failures of the commit protocol. All are user errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The stream's current revision did not match the expectation.
    #[error(
        "revision conflict on stream {stream_id}: expected {expected}, actual {}",
        .actual.map_or_else(|| "no-stream".to_string(), |rev| rev.to_string())
    )]
    RevisionConflict {
        stream_id: StreamId,
        expected: ExpectedRevision,
        actual: Option<StreamRev>,
    },

    /// A command id was re-used within a stream with a different payload set.
    #[error("command id {command_id} already used on stream {stream_id} with different events")]
    CommandIdReuse {
        stream_id: StreamId,
        command_id: breccia_types::CommandId,
    },

    /// The presented tenant does not own the stream. Streams never mix
    /// tenants; even the `system` token cannot append across them.
    #[error("tenant mismatch on stream {stream_id}")]
    TenantMismatch { stream_id: StreamId },
}

/// What a validated command produced.
#[derive(Debug)]
pub enum Outcome {
    /// New events to serialize and persist.
    Committed(Committed),
    /// Exact duplicate of an earlier command: the original result, no new
    /// events, no revision movement.
    Idempotent(AppendResult),
}

/// A freshly assigned batch, not yet durable.
#[derive(Debug)]
pub struct Committed {
    /// Fully positioned events, in order.
    pub events: Vec<Event>,
    /// The result to return to the caller once the batch is durable.
    pub result: AppendResult,
}

/// CRC32-C over a length-prefixed payload set.
///
/// Identifies "the same events" for idempotency checks without retaining
/// payload bytes. Length prefixes keep `["ab", "c"]` distinct from
/// `["a", "bc"]`.
pub fn payload_set_crc<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = breccia_crypto::Crc32c::new();
    for payload in payloads {
        hasher.update(&(payload.len() as u32).to_le_bytes());
        hasher.update(payload);
    }
    hasher.finalize()
}

/// Validates one append command against staged state and, on success,
/// assigns its revisions and global positions.
///
/// The tenant check comes first: an existing stream only ever accepts its
/// owning tenant. The idempotency check then runs before the revision
/// check: a retried command must return its original result even though
/// the stream has since moved past the retried `expected` revision.
pub fn apply_append<B: StateView + ?Sized>(
    staged: &mut Staged<'_, B>,
    cmd: &AppendCommand,
    tenant_id: &TenantId,
    timestamp: Timestamp,
) -> Result<Outcome, KernelError> {
    assert!(!cmd.events.is_empty(), "append command must carry events");

    if staged
        .stream(&cmd.stream_id)
        .is_some_and(|s| &s.tenant_id != tenant_id)
    {
        return Err(KernelError::TenantMismatch {
            stream_id: cmd.stream_id.clone(),
        });
    }

    let payload_crc = payload_set_crc(cmd.events.iter().map(|e| e.payload.as_ref()));

    if let Some(prior) = staged.command(&cmd.stream_id, &cmd.command_id) {
        if prior.payload_crc == payload_crc {
            return Ok(Outcome::Idempotent(prior.result));
        }
        return Err(KernelError::CommandIdReuse {
            stream_id: cmd.stream_id.clone(),
            command_id: cmd.command_id.clone(),
        });
    }

    let actual = staged.stream(&cmd.stream_id).map(|s| s.current_rev);
    let conflict = match (cmd.expected, actual) {
        (ExpectedRevision::Any, _) => false,
        (ExpectedRevision::NoStream, None) => false,
        (ExpectedRevision::NoStream, Some(_)) => true,
        (ExpectedRevision::Exact(want), Some(have)) => want != have,
        (ExpectedRevision::Exact(_), None) => true,
    };
    if conflict {
        return Err(KernelError::RevisionConflict {
            stream_id: cmd.stream_id.clone(),
            expected: cmd.expected,
            actual,
        });
    }

    let count = cmd.events.len() as u64;
    let first_rev = actual.map_or(StreamRev::FIRST, StreamRev::next);
    let last_rev = first_rev.add(count - 1);
    let first_pos = GlobalPos::new(staged.next_pos());
    let last_pos = first_pos.add(count - 1);

    let events: Vec<Event> = cmd
        .events
        .iter()
        .enumerate()
        .map(|(i, data)| Event {
            global_pos: first_pos.add(i as u64),
            stream_id: cmd.stream_id.clone(),
            stream_rev: first_rev.add(i as u64),
            tenant_id: tenant_id.clone(),
            command_id: cmd.command_id.clone(),
            timestamp,
            payload: data.payload.clone(),
        })
        .collect();

    let result = AppendResult {
        first_rev,
        last_rev,
        first_pos,
        last_pos,
    };

    staged.record_commit(
        cmd.stream_id.clone(),
        cmd.command_id.clone(),
        StreamState {
            tenant_id: tenant_id.clone(),
            current_rev: last_rev,
            head_pos: last_pos,
        },
        CommandRecord {
            result,
            payload_crc,
        },
        events.iter().map(|e| e.global_pos).collect(),
    );

    // Postcondition: positions and revisions advanced by exactly `count`.
    debug_assert_eq!(staged.next_pos(), last_pos.as_u64() + 1);
    debug_assert_eq!(result.event_count(), count);

    Ok(Outcome::Committed(Committed { events, result }))
}
