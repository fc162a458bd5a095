//! # breccia-types: Core types for Breccia
//!
//! Shared types used across the Breccia event store:
//! - Positions ([`GlobalPos`], [`StreamRev`], [`ExpectedRevision`])
//! - Identifiers ([`StreamId`], [`TenantId`], [`CommandId`])
//! - Temporal types ([`Timestamp`])
//! - Append inputs and outputs ([`EventData`], [`Event`], [`AppendCommand`],
//!   [`AppendResult`])
//!
//! Positions are 64-bit end-to-end. There is no narrowing anywhere in the
//! store; bindings that cannot represent a `u64` must reject it at their own
//! boundary.

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Maximum byte length of a stream, tenant, or command identifier.
pub const MAX_ID_BYTES: usize = 255;

/// Default cap on a single event payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

// ============================================================================
// Positions
// ============================================================================

/// Position of a record in the global log.
///
/// Assigned at commit, strictly increasing across the whole store, never
/// reused. Positions are 1-based; zero is not a valid position, which lets
/// `checkpoint + 1` style arithmetic start scans from [`GlobalPos::FIRST`]
/// without an `Option`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GlobalPos(u64);

impl GlobalPos {
    /// The first valid position.
    pub const FIRST: GlobalPos = GlobalPos(1);

    /// Creates a position from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is zero. Zero is reserved as "before the log".
    pub fn new(value: u64) -> Self {
        assert!(value > 0, "GlobalPos cannot be zero");
        Self(value)
    }

    /// Returns the raw `u64` value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next position.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns this position advanced by `count`.
    pub fn add(self, count: u64) -> Self {
        Self(self.0 + count)
    }
}

impl Display for GlobalPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision of an event within its stream.
///
/// Revisions are 1-based and contiguous: the first event of a stream is
/// revision 1, and `current_rev` equals the number of events in the stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StreamRev(u64);

impl StreamRev {
    /// The first revision in a stream.
    pub const FIRST: StreamRev = StreamRev(1);

    /// Creates a revision from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw `u64` value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next revision.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns this revision advanced by `count`.
    pub fn add(self, count: u64) -> Self {
        Self(self.0 + count)
    }
}

impl Display for StreamRev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expected stream state for optimistic concurrency.
///
/// The source system encoded this as a sentinel integer (`-1` any, `0`
/// absent, `N` exact); an enum keeps the three cases impossible to confuse
/// and keeps revisions unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedRevision {
    /// The stream must not exist yet.
    NoStream,
    /// The stream's current revision must equal this value.
    Exact(StreamRev),
    /// Any state is acceptable (no concurrency check).
    Any,
}

impl Display for ExpectedRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedRevision::NoStream => write!(f, "no-stream"),
            ExpectedRevision::Exact(rev) => write!(f, "{rev}"),
            ExpectedRevision::Any => write!(f, "any"),
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

fn check_id(kind: &str, id: &str) {
    assert!(!id.is_empty(), "{kind} must not be empty");
    assert!(
        id.len() <= MAX_ID_BYTES,
        "{kind} exceeds {MAX_ID_BYTES} bytes"
    );
}

/// Identifier of a logical aggregate's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream id.
    ///
    /// # Panics
    ///
    /// Panics if the id is empty or longer than [`MAX_ID_BYTES`]. Ids come
    /// from the embedding application, not from the wire; malformed ids are
    /// a caller bug.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        check_id("stream id", &id);
        Self(id)
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Tenant isolation token.
///
/// Every record and every projection row carries one. The reserved
/// [`TenantId::system`] token crosses tenants and is meant for operational
/// tooling only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    /// The reserved name of the privileged cross-tenant token.
    pub const SYSTEM_NAME: &'static str = "system";

    /// Creates a tenant id.
    ///
    /// # Panics
    ///
    /// Panics if the id is empty or longer than [`MAX_ID_BYTES`].
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        check_id("tenant id", &id);
        Self(id)
    }

    /// Returns the privileged `system` token.
    pub fn system() -> Self {
        Self(Self::SYSTEM_NAME.to_string())
    }

    /// Returns `true` for the privileged `system` token.
    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM_NAME
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Caller-supplied idempotency key, unique within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(String);

impl CommandId {
    /// Creates a command id.
    ///
    /// # Panics
    ///
    /// Panics if the id is empty or longer than [`MAX_ID_BYTES`].
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        check_id("command id", &id);
        Self(id)
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// Time
// ============================================================================

/// Milliseconds since the unix epoch, assigned by the writer at commit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from raw milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Returns the raw millisecond value.
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Events
// ============================================================================

/// An event payload to be appended. Input form: positions are assigned at
/// commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Opaque payload bytes. The store never interprets them.
    pub payload: Bytes,
}

impl EventData {
    /// Creates an event from payload bytes.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A stored event with its full position information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Position in the global log.
    pub global_pos: GlobalPos,
    /// Stream this event belongs to.
    pub stream_id: StreamId,
    /// Revision within the stream.
    pub stream_rev: StreamRev,
    /// Tenant the event was written under.
    pub tenant_id: TenantId,
    /// Idempotency key of the originating command.
    pub command_id: CommandId,
    /// Commit wall-clock time.
    pub timestamp: Timestamp,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

// ============================================================================
// Commands and results
// ============================================================================

/// A command to append events to one stream.
#[derive(Debug, Clone)]
pub struct AppendCommand {
    /// Idempotency key, unique within the stream.
    pub command_id: CommandId,
    /// Target stream.
    pub stream_id: StreamId,
    /// Optimistic-concurrency expectation.
    pub expected: ExpectedRevision,
    /// Events to append. Must be non-empty.
    pub events: Vec<EventData>,
}

impl AppendCommand {
    /// Creates an append command.
    ///
    /// # Panics
    ///
    /// Panics if `events` is empty. Empty appends are a caller bug.
    pub fn new(
        command_id: impl Into<CommandId>,
        stream_id: impl Into<StreamId>,
        expected: ExpectedRevision,
        events: Vec<EventData>,
    ) -> Self {
        assert!(!events.is_empty(), "append command must carry events");
        Self {
            command_id: command_id.into(),
            stream_id: stream_id.into(),
            expected,
            events,
        }
    }
}

/// The result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// First stream revision assigned.
    pub first_rev: StreamRev,
    /// Last stream revision assigned.
    pub last_rev: StreamRev,
    /// First global position assigned.
    pub first_pos: GlobalPos,
    /// Last global position assigned.
    pub last_pos: GlobalPos,
}

impl AppendResult {
    /// Number of events covered by this result.
    pub fn event_count(&self) -> u64 {
        self.last_pos.as_u64() - self.first_pos.as_u64() + 1
    }
}
