//! Error taxonomy surfaced by the store facade.
//!
//! Three families, each with one owner:
//!
//! - **User errors** (`RevisionConflict`, `CommandIdReuse`, `TenantMismatch`,
//!   `StreamNotFound`, `PayloadTooLarge`, `CheckpointRegression`): returned
//!   to the caller, never logged as failures by the core.
//! - **Shedding** (`Overloaded`): returned immediately; the caller decides
//!   whether to retry.
//! - **Environmental** (`Corrupted`, `StorageFull`, `Io`,
//!   `StoreUnhealthy`): a commit-path occurrence quiesces the writer until
//!   the store is reopened; readers and projections keep serving committed
//!   state.

use breccia_kernel::KernelError;
use breccia_projections::ProjectionError;
use breccia_storage::StorageError;
use breccia_types::{CommandId, ExpectedRevision, GlobalPos, StreamId, StreamRev};
use thiserror::Error;

/// Errors returned by [`crate::Breccia`].
#[derive(Debug, Error)]
pub enum Error {
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
        command_id: CommandId,
    },

    /// The presented tenant may not access the stream.
    #[error("tenant mismatch")]
    TenantMismatch,

    /// No such stream.
    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    /// The admission controller shed this write; retry later.
    #[error("store overloaded")]
    Overloaded,

    /// An event payload exceeded the configured cap.
    #[error("payload of {size} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { size: usize, max: usize },

    /// Durably committed bytes failed verification.
    #[error("corrupted record in segment {segment} at offset {offset}")]
    Corrupted { segment: u64, offset: u64 },

    /// A projection checkpoint advance did not strictly increase.
    #[error(
        "checkpoint regression on projection {projection}: proposed {proposed}, current {}",
        .current.map_or_else(|| "none".to_string(), |c| c.to_string())
    )]
    CheckpointRegression {
        projection: String,
        proposed: GlobalPos,
        current: Option<GlobalPos>,
    },

    /// The storage device is out of space.
    #[error("storage device full")]
    StorageFull,

    /// A commit-path failure quiesced the writer; reopen to recover.
    #[error("store unhealthy after a write failure; reopen to recover")]
    StoreUnhealthy,

    /// `init_projections` has not been called.
    #[error("projections not initialized")]
    ProjectionsNotInitialized,

    /// Projection runtime error (registration, workers, state store).
    #[error(transparent)]
    Projection(ProjectionError),

    /// Underlying I/O failure outside the commit path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `true` for out-of-space conditions across platforms.
pub(crate) fn is_disk_full(e: &std::io::Error) -> bool {
    // ENOSPC on unix, ERROR_DISK_FULL on windows.
    matches!(e.raw_os_error(), Some(28) | Some(112))
}

impl From<KernelError> for Error {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::RevisionConflict {
                stream_id,
                expected,
                actual,
            } => Error::RevisionConflict {
                stream_id,
                expected,
                actual,
            },
            KernelError::CommandIdReuse {
                stream_id,
                command_id,
            } => Error::CommandIdReuse {
                stream_id,
                command_id,
            },
            KernelError::TenantMismatch { .. } => Error::TenantMismatch,
        }
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(io) if is_disk_full(&io) => Error::StorageFull,
            StorageError::Io(io) => Error::Io(io),
            StorageError::Corrupted { segment, offset } => Error::Corrupted { segment, offset },
            // Decode-level failures only surface through the read path,
            // where they mean a damaged segment.
            StorageError::InvalidMagic { offset }
            | StorageError::UnsupportedFlags { offset, .. }
            | StorageError::ChecksumMismatch { offset }
            | StorageError::InvalidUtf8 { offset }
            | StorageError::TrailerMismatch { offset } => Error::Corrupted { segment: 0, offset },
            StorageError::UnexpectedEof => Error::Corrupted {
                segment: 0,
                offset: 0,
            },
        }
    }
}

/// Maps a projection-layer error onto the facade taxonomy, attributing
/// checkpoint regressions to their projection.
pub(crate) fn projection_error(name: &str, e: ProjectionError) -> Error {
    match e {
        ProjectionError::Store(breccia_store::StoreError::CheckpointRegression {
            proposed,
            current,
        }) => Error::CheckpointRegression {
            projection: name.to_string(),
            proposed,
            current,
        },
        ProjectionError::Store(breccia_store::StoreError::Io(io)) if is_disk_full(&io) => {
            Error::StorageFull
        }
        other => Error::Projection(other),
    }
}
