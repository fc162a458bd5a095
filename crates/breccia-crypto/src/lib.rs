//! # breccia-crypto: Checksum primitives for Breccia
//!
//! Currently a single algorithm: CRC32-C, used by the segment record codec,
//! the batch trailer, and the projection store journal.

pub mod crc32c;

pub use crc32c::{crc32c, Crc32c};
