//! Datagram type and the wire command enumeration.

mod decoder;
mod encoder;

pub use decoder::{DecodeOutcome, FrameDecoder};
pub use encoder::encode;

use thiserror::Error;

/// Start-of-frame marker. Never escaped, never CRC-covered.
pub const START: u8 = 0x2B;
/// Escape marker. Prefixes any literal occurrence of [`START`] or itself
/// in the logical frame body.
pub const ESCAPE: u8 = 0x2D;

/// Maximum payload length for the short-length frame form (`len` fits in
/// one byte and `len = 4 + data.len()` must itself fit in 255).
pub const MAX_DATA_LEN: usize = 251;

/// The fixed command enumeration carried in byte 0 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Read,
    Write,
    LongWrite,
    Reserved1,
    Response,
    LongResponse,
    Reserved2,
    ReadPeriodically,
    Extension,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Read => 1,
            Command::Write => 2,
            Command::LongWrite => 3,
            Command::Reserved1 => 4,
            Command::Response => 5,
            Command::LongResponse => 6,
            Command::Reserved2 => 7,
            Command::ReadPeriodically => 8,
            Command::Extension => 0x3C,
        }
    }

    pub fn from_code(code: u8) -> Option<Command> {
        match code {
            1 => Some(Command::Read),
            2 => Some(Command::Write),
            3 => Some(Command::LongWrite),
            4 => Some(Command::Reserved1),
            5 => Some(Command::Response),
            6 => Some(Command::LongResponse),
            7 => Some(Command::Reserved2),
            8 => Some(Command::ReadPeriodically),
            0x3C => Some(Command::Extension),
            _ => None,
        }
    }
}

/// One logical protocol message: a command, a 32-bit register id, and a
/// payload of at most [`MAX_DATA_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub cmd: Command,
    pub id: u32,
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn new(cmd: Command, id: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        if data.len() > MAX_DATA_LEN {
            return Err(FrameError::DataTooLong(data.len()));
        }
        Ok(Self { cmd, id, data })
    }
}

/// Errors raised while building or parsing a frame.
///
/// `DataTooLong` is a fail-fast encoder validation error and is never
/// retried (the `id`/`cmd`/data-byte range checks spec.md also lists are
/// enforced by the type system here: `u32`, `Command`, and `u8` cannot
/// hold an out-of-range value, so no corresponding variant exists).
/// Decoder-side variants (`ShortFrame`, `CrcMismatch`, `UnknownCommand`)
/// are recoverable: the pipeline discards and retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("data length {0} exceeds maximum of {MAX_DATA_LEN}")]
    DataTooLong(usize),
    #[error("short frame: len field {0} is below the 4-byte header minimum")]
    ShortFrame(u8),
    #[error("CRC mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    CrcMismatch { expected: u16, computed: u16 },
    #[error("unknown command code {0:#04x}")]
    UnknownCommand(u8),
}
