//! Incremental frame decoder.
//!
//! [`FrameDecoder::decode_one`] attempts to parse exactly one frame out of
//! an externally owned, append-only byte buffer, per call. It never owns
//! the buffer itself (the caller, typically [`crate::connection`]'s reader
//! loop, slices off whatever byte count the outcome reports), which keeps
//! the decoder free of any dependency on the transport or connection
//! lifecycle.
//!
//! A [`tokio_util::codec::Decoder`] implementation is also provided for
//! callers who prefer to drive the decoder through `FramedRead`. Unlike a
//! typical "advance and return `Ok(None)`" resync codec, recoverable
//! errors are surfaced as `Err` rather than swallowed: the buffer has
//! already been resynced past the bad frame, but the caller (the request
//! pipeline) needs to observe the failure to retry or fail a waiter.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::{Command, Datagram, FrameError, ESCAPE, START};
use crate::crc::Crc16;

/// Result of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete, valid frame. `consumed` raw (escaped) bytes should be
    /// sliced off the front of the buffer.
    Frame { datagram: Datagram, consumed: usize },
    /// Not enough bytes yet to tell; the buffer is left untouched.
    NeedMoreData,
    /// A structural or CRC failure. `discard` raw bytes (everything up to
    /// and including the offending start byte) should be sliced off
    /// before the next attempt, so a single corrupted frame cannot
    /// permanently desynchronize the stream.
    Recoverable { error: FrameError, discard: usize },
}

/// Stateless incremental frame parser. See the module docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Attempt to parse exactly one frame starting at the first
    /// unambiguous frame start in `buf`.
    pub fn decode_one(&self, buf: &[u8]) -> DecodeOutcome {
        let Some(start) = find_unescaped_start(buf) else {
            return DecodeOutcome::NeedMoreData;
        };

        let mut logical: Vec<u8> = Vec::new();
        let mut required: Option<usize> = None;
        // Logical length of cmd|len|id|data alone, i.e. everything the
        // encoder escapes. Once reached, the remaining bytes up to
        // `required` are the raw, never-escaped CRC trailer: they must be
        // copied through literally rather than re-run through the
        // escape/resync rules, since a CRC byte can legitimately equal
        // 0x2B or 0x2D without that meaning "next frame" or "escape".
        let mut body_required: Option<usize> = None;
        let mut raw_i = start + 1;

        loop {
            if let Some(req) = required {
                if logical.len() >= req {
                    break;
                }
            }

            if raw_i >= buf.len() {
                return DecodeOutcome::NeedMoreData;
            }

            if let Some(body_req) = body_required {
                if logical.len() >= body_req {
                    logical.push(buf[raw_i]);
                    raw_i += 1;
                    continue;
                }
            }

            let b = buf[raw_i];
            if b == ESCAPE {
                if raw_i + 1 >= buf.len() {
                    return DecodeOutcome::NeedMoreData;
                }
                logical.push(buf[raw_i + 1]);
                raw_i += 2;
            } else if b == START {
                // A second unescaped start marks the next frame: this one
                // ended early (too short / garbage). Abandon it.
                break;
            } else {
                logical.push(b);
                raw_i += 1;
            }

            if logical.len() == 1 {
                if Command::from_code(logical[0]).is_none() {
                    return DecodeOutcome::Recoverable {
                        error: FrameError::UnknownCommand(logical[0]),
                        discard: start + 1,
                    };
                }
            }

            if required.is_none() && logical.len() >= 2 {
                let len = logical[1] as usize;
                if len < 4 {
                    // A `len` below the 4-byte header minimum can never be
                    // completed into a valid frame, so don't wait on bytes
                    // that may never arrive: reject it now.
                    return DecodeOutcome::Recoverable {
                        error: FrameError::ShortFrame(logical[1]),
                        discard: start + 1,
                    };
                }
                required = Some(len + 4);
                body_required = Some(len + 2);
            }
        }

        if logical.len() < 2 {
            return DecodeOutcome::Recoverable {
                error: FrameError::ShortFrame(*logical.first().unwrap_or(&0)),
                discard: start + 1,
            };
        }

        let len = logical[1];
        if (len as usize) < 4 {
            return DecodeOutcome::Recoverable {
                error: FrameError::ShortFrame(len),
                discard: start + 1,
            };
        }

        let required = len as usize + 4;
        if logical.len() < required {
            // Hit the next start before this frame finished: garbage.
            return DecodeOutcome::Recoverable {
                error: FrameError::ShortFrame(len),
                discard: start + 1,
            };
        }

        let cmd = Command::from_code(logical[0]).expect("validated above");
        let id = u32::from_be_bytes([logical[2], logical[3], logical[4], logical[5]]);
        let data_len = len as usize - 4;
        let data = logical[6..6 + data_len].to_vec();
        let crc_hi = logical[6 + data_len];
        let crc_lo = logical[6 + data_len + 1];
        let expected = u16::from_be_bytes([crc_hi, crc_lo]);

        let mut crc = Crc16::new();
        crc.push_bytes(&logical[0..6 + data_len]);
        let computed = crc.finalize();

        if computed != expected {
            return DecodeOutcome::Recoverable {
                error: FrameError::CrcMismatch { expected, computed },
                discard: start + 1,
            };
        }

        let datagram = Datagram { cmd, id, data };
        DecodeOutcome::Frame {
            datagram,
            consumed: raw_i,
        }
    }
}

/// Scan for the first `START` byte whose immediately preceding byte is not
/// `ESCAPE` (i.e. an unescaped start-of-frame).
fn find_unescaped_start(buf: &[u8]) -> Option<usize> {
    for (i, &b) in buf.iter().enumerate() {
        if b == START && (i == 0 || buf[i - 1] != ESCAPE) {
            return Some(i);
        }
    }
    None
}

impl Decoder for FrameDecoder {
    type Item = Datagram;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Datagram>, FrameError> {
        match self.decode_one(src) {
            DecodeOutcome::Frame { datagram, consumed } => {
                src.advance(consumed);
                Ok(Some(datagram))
            }
            DecodeOutcome::NeedMoreData => Ok(None),
            DecodeOutcome::Recoverable { error, discard } => {
                src.advance(discard);
                Err(error)
            }
        }
    }
}
