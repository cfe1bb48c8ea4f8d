//! Error taxonomy: recoverable (retryable within a job's retry budget) and
//! terminal (surfaced to the caller immediately).

use thiserror::Error;

use crate::frame::FrameError;

/// Errors a job's retry policy may absorb.
#[derive(Debug, Clone, Error)]
pub enum RecoverableError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("response id {got:#010x} did not match request id {expected:#010x}")]
    IdMismatch { expected: u32, got: u32 },
    #[error("write verification mismatch: expected {expected:?}, got {got:?}")]
    VerifyMismatch { expected: Vec<u8>, got: Vec<u8> },
    #[error("receive timed out after {0:?}")]
    ReceiveTimeout(std::time::Duration),
    #[error("transient transport error: {0}")]
    TransientIo(String),
}

/// Errors surfaced to the caller without retry.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: std::time::Duration,
    },
    #[error("host unreachable: {0}")]
    HostUnreachable(#[source] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("register {0:#010x} is not writable")]
    NotWritable(u32),
    #[error("register {0:#010x} rejected by validation predicate")]
    ValidationRejected(u32),
    #[error("unsupported wire type for register {0:#010x}")]
    UnsupportedWireType(u32),
    #[error("register {0:#010x} is unknown to the catalog")]
    UnknownRegister(u32),
    #[error("device not ready: status code {0:#04x}")]
    DeviceNotReady(u8),
    #[error("retry budget exhausted after {attempts} attempts: {cause}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        cause: RecoverableError,
    },
    #[error("connection closed")]
    ConnectionClosed,
}

/// Unified public error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Recoverable(#[from] RecoverableError),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}
