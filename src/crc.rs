//! CRC-16 register used to protect protocol frames.
//!
//! Polynomial 0x1021, initial value 0xFFFF, no reflection, no final XOR,
//! the same CCITT-FALSE parameters the bm13xx protocol uses for its job
//! frames. The register is fed byte-by-byte; on `finalize`, an odd total
//! byte count is padded with one zero byte before the running value is
//! read out, since the device computes its checksum over payloads that
//! must be an even number of bytes.

use crc_all::CrcAlgo;

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

const ALGO: CrcAlgo<u16> = CrcAlgo::<u16>::new(POLY, 16, INIT, 0, false);

/// Incremental CRC-16 register with the protocol's odd-byte pad rule.
#[derive(Debug, Clone)]
pub struct Crc16 {
    crc: u16,
    odd_bytes: bool,
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc16 {
    pub fn new() -> Self {
        Self {
            crc: INIT,
            odd_bytes: false,
        }
    }

    /// Feed one byte into the register.
    pub fn push_byte(&mut self, byte: u8) {
        ALGO.update_crc(&mut self.crc, &[byte]);
        self.odd_bytes = !self.odd_bytes;
    }

    /// Feed a sequence of bytes into the register.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }

    /// Finalize the register, applying the zero-pad rule if an odd number
    /// of bytes were fed, and return the 16-bit checksum.
    pub fn finalize(mut self) -> u16 {
        if self.odd_bytes {
            ALGO.update_crc(&mut self.crc, &[0]);
        }
        ALGO.finish_crc(&self.crc)
    }
}

/// Compute the checksum of a complete byte slice in one call.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.push_bytes(bytes);
    crc.finalize()
}
