//! # breccia-kernel: Functional core of Breccia's commit protocol
//!
//! The kernel is the pure, deterministic heart of the write path. It holds
//! the stream index and idempotency index in memory and decides, for each
//! append command, whether it conflicts, deduplicates, or commits — and at
//! which positions. It never touches disk, never reads a clock, and never
//! logs: timestamps come in as arguments and I/O is the runtime's job.
//!
//! ## Key principles
//!
//! - **No I/O**: the kernel validates and assigns; the writer thread
//!   persists and then publishes the staged results back into [`State`]
//! - **Staged over committed**: a group-commit drain validates every
//!   command against committed state plus the earlier commands of the same
//!   drain ([`Staged`]); nothing becomes committed until the fsync returns
//! - **Rebuildable**: [`Replayer`] reconstructs the entire state from the
//!   recovered log, so the state needs no persistence of its own

pub mod kernel;
pub mod replay;
pub mod staged;
pub mod state;

pub(crate) mod sieve_cache;

pub use kernel::{apply_append, payload_set_crc, Committed, KernelError, Outcome};
pub use replay::Replayer;
pub use staged::Staged;
pub use state::{CommandRecord, StagedParts, State, StateView, StreamState};
