//! Frame encoder: builds the on-wire byte sequence for a [`Datagram`].

use super::{Datagram, ESCAPE, MAX_DATA_LEN, START};
use crate::crc::Crc16;

/// Encode a datagram into a contiguous wire-format byte buffer.
///
/// Layout: `0x2B | ESC(cmd) | ESC(len) | ESC(id be) | ESC(data) | crc_hi | crc_lo`.
/// The leading start byte is never escaped and never enters the CRC; the
/// two CRC bytes are emitted raw (unescaped) and are themselves never
/// CRC-covered.
pub fn encode(dg: &Datagram) -> Vec<u8> {
    debug_assert!(dg.data.len() <= MAX_DATA_LEN);

    let len = 4 + dg.data.len() as u8;
    let mut out = Vec::with_capacity(2 + 2 * (6 + dg.data.len()) + 2);
    let mut crc = Crc16::new();

    out.push(START);

    push_escaped(&mut out, dg.cmd.code());
    crc.push_byte(dg.cmd.code());

    push_escaped(&mut out, len);
    crc.push_byte(len);

    for byte in dg.id.to_be_bytes() {
        push_escaped(&mut out, byte);
        crc.push_byte(byte);
    }

    for &byte in &dg.data {
        push_escaped(&mut out, byte);
        crc.push_byte(byte);
    }

    let checksum = crc.finalize();
    out.extend_from_slice(&checksum.to_be_bytes());

    out
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == START || byte == ESCAPE {
        out.push(ESCAPE);
    }
    out.push(byte);
}
