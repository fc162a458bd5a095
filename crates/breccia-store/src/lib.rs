//! # breccia-store: Projection state store
//!
//! A keyed, tenant-scoped table store backing the projection runtime. Each
//! registered projection owns one `<name>.table` file: a schema manifest
//! followed by a journal of CRC-protected entries. Applying a batch of ops
//! and advancing the checkpoint is a single journal entry plus one fsync —
//! either both become durable or neither does, which is what makes
//! projection effects exactly-once.
//!
//! Rows live in memory and are rebuilt by replaying the journal on open
//! (with the same torn-tail truncation discipline as the event log).
//! Snapshot compaction folds a long journal back into one entry.

pub mod journal;
pub mod table;
pub mod value;

pub use journal::JournalEntry;
pub use table::{TableOp, TableStore};
pub use value::{ColumnDef, ColumnType, Row, Schema, Value};

use breccia_types::GlobalPos;
use thiserror::Error;

/// Errors from the projection state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The table file is not a valid manifest + journal.
    #[error("corrupted table file {table} at offset {offset}")]
    Corrupted { table: String, offset: u64 },

    /// A schema failed structural validation at registration.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// An existing table file carries a different schema than registered.
    #[error("schema mismatch for table {0}")]
    SchemaMismatch(String),

    /// An op referenced a column the schema does not define.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    /// An op supplied a value of the wrong type for a column.
    #[error("type mismatch for column {column} in table {table}")]
    TypeMismatch { table: String, column: String },

    /// An op omitted a non-nullable column.
    #[error("missing value for non-nullable column {column} in table {table}")]
    MissingColumn { table: String, column: String },

    /// A checkpoint advance did not strictly increase.
    #[error(
        "checkpoint regression: proposed {proposed}, current {}",
        .current.map_or_else(|| "none".to_string(), |c| c.to_string())
    )]
    CheckpointRegression {
        proposed: GlobalPos,
        current: Option<GlobalPos>,
    },
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
