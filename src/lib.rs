//! Client library for a byte-stuffed, CRC-framed register protocol spoken
//! over a persistent TCP stream by an embedded device (e.g. a solar
//! inverter/battery controller).
//!
//! The crate is organized around four collaborators: [`frame`] (the wire
//! codec), [`pipeline`] (single-flight request serialization with retry),
//! [`connection`] (per-socket lifecycle), and [`pool`] (keyed connection
//! reuse). The register catalog (which registers exist, their wire types,
//! and whether they're writable) is supplied by the host application
//! through the [`catalog`] traits; this crate has no built-in knowledge of
//! any specific device's registers.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod crc;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod pool;
pub mod transport;

pub use cache::ResponseCache;
pub use catalog::{RegisterCatalog, RegisterDescriptor, RegisterValue, StaticCatalog, WireType};
pub use config::Config;
pub use connection::{ConnState, Connection};
pub use error::{Error, RecoverableError, TerminalError};
pub use frame::{Command, Datagram};
pub use pool::Pool;
pub use transport::{TcpTransport, Transport};
