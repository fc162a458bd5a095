//! # breccia-storage: Durable event log for Breccia
//!
//! This crate owns everything that touches segment files:
//!
//! - [`record`]: on-disk record framing with CRC32-C integrity
//! - [`batch`]: serialization of commit batches (events + batch trailer)
//! - [`segment`]: segment metadata, naming, and per-segment offset tables
//! - [`recovery`]: torn-batch detection and truncation on open
//! - [`log`]: the [`EventLog`] writer handle and [`LogReader`] read handle
//!
//! The log is a sequence of append-only segment files. Each committed batch
//! is terminated by a trailer record; recovery promotes only complete,
//! CRC-valid batches and truncates everything after the first torn one, so a
//! batch is visible after a crash if and only if it was fully durable.

pub mod batch;
pub mod log;
pub mod record;
pub mod recovery;
pub mod segment;

pub use batch::CommitBuffer;
pub use log::{EventLog, LogConfig, LogReader};
pub use record::{CommitRecord, Record, RECORD_OVERHEAD};
pub use segment::{segment_file_name, OffsetTable, SegmentMap, SegmentMeta};

use thiserror::Error;

/// Default maximum segment size in bytes before rotation (128 MiB).
pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 128 * 1024 * 1024;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record did not start with the expected magic bytes.
    #[error("invalid record magic at offset {offset}")]
    InvalidMagic { offset: u64 },

    /// A record used flag bits this version does not understand.
    #[error("unsupported record flags {flags:#04x} at offset {offset}")]
    UnsupportedFlags { flags: u8, offset: u64 },

    /// The data ended before a complete record.
    #[error("unexpected end of segment data")]
    UnexpectedEof,

    /// A record's CRC32-C did not match its contents.
    #[error("record checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    /// An identifier field did not hold valid UTF-8.
    #[error("invalid identifier encoding at offset {offset}")]
    InvalidUtf8 { offset: u64 },

    /// A batch trailer disagreed with the records it covers.
    #[error("batch trailer mismatch at offset {offset}")]
    TrailerMismatch { offset: u64 },

    /// Durably committed data failed verification on the read path.
    #[error("corrupted record in segment {segment} at offset {offset}")]
    Corrupted { segment: u64, offset: u64 },
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
