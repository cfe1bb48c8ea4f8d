//! Byte-stream transport abstraction.
//!
//! A [`Connection`](crate::connection::Connection) talks to its device over
//! whatever implements [`Transport`]; production code uses [`TcpTransport`],
//! tests use an in-memory `tokio::io::DuplexStream`. This mirrors the way
//! the teacher keeps hardware and test doubles behind one call surface
//! rather than branching on `cfg(test)` inside connection logic.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

/// The byte-stream boundary a [`Connection`](crate::connection::Connection)
/// drives. `read` returns `Ok(0)` on a clean EOF, matching
/// `AsyncRead::read`'s convention.
#[async_trait]
pub trait Transport: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    async fn shutdown(&mut self) -> io::Result<()>;
}

/// Production transport over a TCP socket.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to `host:port`, failing with `Err` if the connection does
    /// not establish within `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let addr = (host, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true).ok();
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// In-memory transport over a `tokio::io::duplex` half, used by tests to
/// stand in for a real device without opening a socket.
pub struct DuplexTransport {
    stream: DuplexStream,
}

impl DuplexTransport {
    pub fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
