//! CRC32-C (Castagnoli) checksum implementation.
//!
//! Provides table-driven CRC32-C calculation using the Castagnoli polynomial
//! (0x82F63B78, reversed). Every CRC field in Breccia's on-disk formats —
//! log records, batch trailers, projection journals — uses this algorithm.
//!
//! ## Rationale
//!
//! Implemented in-tree rather than pulled from a crate:
//! - Simple enough to own (~70 lines)
//! - The on-disk format depends on it forever; no upstream churn
//! - CRC32-C is fully specified (RFC 3720 §B.4) and unchanged since 2002
//!
//! ## Usage
//!
//! ```
//! use breccia_crypto::crc32c;
//!
//! // One-shot calculation
//! let checksum = crc32c(b"hello world");
//!
//! // Incremental calculation for streaming data
//! let mut hasher = breccia_crypto::Crc32c::new();
//! hasher.update(b"hello ");
//! hasher.update(b"world");
//! let checksum = hasher.finalize();
//! ```

/// Castagnoli CRC32-C polynomial (reversed): 0x82F63B78
const POLYNOMIAL: u32 = 0x82F6_3B78;

/// Precomputed lookup table (256 entries), generated at compile time.
const CRC32C_TABLE: [u32; 256] = generate_table();

const fn generate_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the CRC32-C checksum of the given data in one shot.
///
/// # Examples
///
/// ```
/// use breccia_crypto::crc32c;
/// let checksum = crc32c(b"hello world");
/// ```
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    crc ^ 0xFFFF_FFFF
}

/// Incremental CRC32-C hasher for streaming or chunked data.
///
/// Allows computing the checksum over multiple calls to `update()`.
#[derive(Debug, Clone)]
pub struct Crc32c {
    state: u32,
}

impl Crc32c {
    /// Creates a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feeds data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = (self.state >> 8) ^ CRC32C_TABLE[index];
        }
    }

    /// Finalizes the computation and returns the checksum.
    ///
    /// Consumes the hasher to prevent reuse after finalization.
    #[must_use]
    pub fn finalize(self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(crc32c(b""), 0x0000_0000);
    }

    #[test]
    fn known_vectors() {
        // RFC 3720 §B.4 check value
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);

        // 32 bytes of zeros (iSCSI test vector)
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);

        // 32 bytes of 0xFF (iSCSI test vector)
        assert_eq!(crc32c(&[0xFFu8; 32]), 0x62A8_AB43);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let data = b"hello world this is a test";

        let mut hasher = Crc32c::new();
        hasher.update(data);
        assert_eq!(hasher.finalize(), crc32c(data));
    }

    #[test]
    fn chunking_invariant() {
        let data = b"The quick brown fox jumps over the lazy dog";

        for split in 0..data.len() {
            let mut hasher = Crc32c::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            assert_eq!(hasher.finalize(), crc32c(data));
        }
    }

    #[test]
    fn distinguishes_bit_flips() {
        let mut data = vec![0xA5u8; 64];
        let clean = crc32c(&data);
        data[17] ^= 0x01;
        assert_ne!(crc32c(&data), clean);
    }
}
