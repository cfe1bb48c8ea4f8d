//! Per-`(host, port)` connection lifecycle: state machine, the decode
//! loop, idle timer, and the read/write job contracts. The request
//! pipeline's queue/waiter/processing fields live here rather than in a
//! separate type, because spec's own data model places them directly on
//! connection state (`request_queue`, `processing`, `outstanding` are all
//! listed under "Connection state").

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio::sync::Mutex;

use crate::cache::ResponseCache;
use crate::catalog::{RegisterCatalog, RegisterValue};
use crate::config::Config;
use crate::error::{Error, RecoverableError, TerminalError};
use crate::frame::{encode, Command, DecodeOutcome, Datagram, FrameDecoder};
use crate::pipeline::{JobKind, RetryPolicy};
use crate::transport::{TcpTransport, Transport};

/// Lifecycle state of a [`Connection`] (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Ready,
    Closing,
    Closed,
}

struct ConnInner {
    transport: Option<Box<dyn Transport>>,
    read_buffer: BytesMut,
    state: ConnState,
}

/// Failure of one write attempt: either a recoverable wire failure the
/// retry loop may absorb, or a terminal one (pre-check rejection,
/// argument/catalog error) that must not be retried.
enum WriteAttemptError {
    Recoverable(RecoverableError),
    Terminal(TerminalError),
}

/// A live or lazily-established connection to one `(host, port)` device.
/// Owns its own response cache; at most one wire request is ever
/// outstanding on a given instance, enforced by `job_lock`.
pub struct Connection {
    host: String,
    port: u16,
    config: Config,
    catalog: Arc<dyn RegisterCatalog>,
    cache: Mutex<ResponseCache>,
    inner: Mutex<ConnInner>,
    job_lock: Mutex<()>,
    active_jobs: AtomicU32,
    pending_close: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub(crate) fn new(
        host: impl Into<String>,
        port: u16,
        config: Config,
        catalog: Arc<dyn RegisterCatalog>,
        cache_ttl: Duration,
        cache_max: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            port,
            config,
            catalog,
            cache: Mutex::new(ResponseCache::new(cache_ttl, cache_max)),
            inner: Mutex::new(ConnInner {
                transport: None,
                read_buffer: BytesMut::new(),
                state: ConnState::Idle,
            }),
            job_lock: Mutex::new(()),
            active_jobs: AtomicU32::new(0),
            pending_close: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Construct a connection already bound to an open transport, bypassing
    /// dialing. Used by tests (a `DuplexTransport` stand-in for a socket)
    /// and by any caller that wants to bypass the pool entirely (spec
    /// §4.7: "direct construction bypasses the pool and always yields a
    /// fresh instance").
    pub fn with_transport(
        host: impl Into<String>,
        port: u16,
        config: Config,
        catalog: Arc<dyn RegisterCatalog>,
        cache_ttl: Duration,
        cache_max: usize,
        transport: Box<dyn Transport>,
    ) -> Arc<Self> {
        let conn = Self::new(host, port, config, catalog, cache_ttl, cache_max);
        {
            let mut inner = conn
                .inner
                .try_lock()
                .expect("freshly constructed connection is uncontended");
            inner.transport = Some(transport);
            inner.state = ConnState::Ready;
        }
        conn
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn state(&self) -> ConnState {
        self.inner.lock().await.state
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == ConnState::Closed
    }

    /// Read and decode a register's current value, serving from cache
    /// when a fresh-enough entry exists (spec §4.5 read contract, step 1).
    pub async fn query(&self, id: u32) -> Result<RegisterValue, Error> {
        let descriptor = *self
            .catalog
            .get(id)
            .ok_or(TerminalError::UnknownRegister(id))?;

        if let Some(cached) = self.cache.lock().await.get(id) {
            return RegisterValue::decode(descriptor.wire_type, &cached.data, id)
                .map_err(Error::Terminal);
        }

        let _job_guard = self.job_lock.lock().await;
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let result = self.read_with_retry(id, descriptor.wire_type).await;
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        self.note_activity().await;
        self.maybe_finish_pending_close().await;
        result.map_err(Error::Terminal)
    }

    /// Write a register's value, verifying it round-trips via a follow-up
    /// read (spec §4.5 write contract).
    pub async fn write(&self, id: u32, value: RegisterValue) -> Result<(), Error> {
        let descriptor = *self
            .catalog
            .get(id)
            .ok_or(TerminalError::UnknownRegister(id))?;
        if !descriptor.writable {
            return Err(Error::Terminal(TerminalError::NotWritable(id)));
        }
        if let Some(validate) = descriptor.validate {
            if !validate(&value) {
                return Err(Error::Terminal(TerminalError::ValidationRejected(id)));
            }
        }
        let encoded = value
            .encode(descriptor.wire_type, id)
            .map_err(Error::Terminal)?;

        let _job_guard = self.job_lock.lock().await;
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let result = self.write_with_retry(id, &encoded).await;
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        self.note_activity().await;
        self.maybe_finish_pending_close().await;
        result.map_err(Error::Terminal)
    }

    /// Close the connection. If jobs are still in flight, the close is
    /// deferred until `active_jobs` reaches zero (`pending_close`).
    pub async fn close(&self) {
        if self.active_jobs.load(Ordering::SeqCst) > 0 {
            self.pending_close.store(true, Ordering::SeqCst);
            return;
        }
        self.close_now().await;
    }

    pub(crate) fn spawn_idle_watcher(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if conn.is_closed().await {
                    return;
                }
                let elapsed = conn.last_activity.lock().await.elapsed();
                let timeout = conn.config.idle_close_timeout;
                if elapsed < timeout {
                    tokio::time::sleep(timeout - elapsed).await;
                    continue;
                }
                if conn.active_jobs.load(Ordering::SeqCst) > 0 {
                    conn.pending_close.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                tracing::debug!(host = %conn.host, port = conn.port, "idle timeout elapsed, closing");
                conn.close_now().await;
                return;
            }
        });
    }

    async fn note_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    async fn maybe_finish_pending_close(&self) {
        if self.pending_close.load(Ordering::SeqCst) && self.active_jobs.load(Ordering::SeqCst) == 0
        {
            self.pending_close.store(false, Ordering::SeqCst);
            self.close_now().await;
        }
    }

    async fn close_now(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut transport) = inner.transport.take() {
            let _ = transport.shutdown().await;
        }
        inner.state = ConnState::Closed;
        inner.read_buffer.clear();
        tracing::info!(host = %self.host, port = self.port, "connection closed");
    }

    async fn ensure_connected(&self, inner: &mut ConnInner) -> Result<(), TerminalError> {
        if inner.state == ConnState::Ready && inner.transport.is_some() {
            return Ok(());
        }
        inner.state = ConnState::Connecting;
        tracing::debug!(host = %self.host, port = self.port, "dialing");
        match TcpTransport::connect(&self.host, self.port, self.config.dial_timeout).await {
            Ok(transport) => {
                inner.transport = Some(Box::new(transport));
                inner.state = ConnState::Ready;
                inner.read_buffer.clear();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                inner.state = ConnState::Closed;
                Err(TerminalError::ConnectTimeout {
                    host: self.host.clone(),
                    port: self.port,
                    timeout: self.config.dial_timeout,
                })
            }
            Err(e) => {
                inner.state = ConnState::Closed;
                Err(TerminalError::HostUnreachable(e))
            }
        }
    }

    async fn send(&self, inner: &mut ConnInner, dg: &Datagram) -> Result<(), RecoverableError> {
        let bytes = encode(dg);
        let transport = inner
            .transport
            .as_mut()
            .ok_or_else(|| RecoverableError::TransientIo("not connected".to_string()))?;
        transport
            .write_all(&bytes)
            .await
            .map_err(|e| RecoverableError::TransientIo(e.to_string()))
    }

    /// Read and decode frames until one with `cmd == Response` and
    /// `id == expected_id` arrives, or `receive_timeout` elapses. Any
    /// other decoded frame is an unsolicited push: logged and discarded,
    /// never satisfying this (or any) pending request (spec §4.5).
    async fn receive_matching(
        &self,
        inner: &mut ConnInner,
        expected_id: u32,
    ) -> Result<Datagram, RecoverableError> {
        let decoder = FrameDecoder::new();
        let deadline = Instant::now() + self.config.receive_timeout;

        loop {
            match decoder.decode_one(&inner.read_buffer) {
                DecodeOutcome::Frame { datagram, consumed } => {
                    inner.read_buffer.advance(consumed);
                    if datagram.cmd == Command::Response {
                        if datagram.id == expected_id {
                            return Ok(datagram);
                        }
                        // A Response to the *wrong* id is not an unrelated
                        // push frame: on a half-duplex wire the next
                        // Response always belongs to the most recently
                        // sent request (spec §9), so a mismatch here means
                        // the pipeline has desynced. Raise recoverable
                        // rather than discarding and waiting forever.
                        return Err(RecoverableError::IdMismatch {
                            expected: expected_id,
                            got: datagram.id,
                        });
                    }
                    tracing::warn!(
                        id = datagram.id,
                        cmd = ?datagram.cmd,
                        "discarding unsolicited frame"
                    );
                }
                DecodeOutcome::Recoverable { error, discard } => {
                    inner.read_buffer.advance(discard);
                    return Err(RecoverableError::Frame(error));
                }
                DecodeOutcome::NeedMoreData => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(RecoverableError::ReceiveTimeout(
                            self.config.receive_timeout,
                        ));
                    }
                    let transport = inner.transport.as_mut().ok_or_else(|| {
                        RecoverableError::TransientIo("not connected".to_string())
                    })?;
                    let mut buf = [0u8; 4096];
                    let n = match tokio::time::timeout(remaining, transport.read(&mut buf)).await {
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(RecoverableError::TransientIo(e.to_string())),
                        Err(_) => {
                            return Err(RecoverableError::ReceiveTimeout(
                                self.config.receive_timeout,
                            ))
                        }
                    };
                    if n == 0 {
                        return Err(RecoverableError::TransientIo(
                            "transport closed by peer".to_string(),
                        ));
                    }
                    inner.read_buffer.extend_from_slice(&buf[..n]);
                }
            }
        }
    }

    async fn read_with_retry(
        &self,
        id: u32,
        wire_type: crate::catalog::WireType,
    ) -> Result<RegisterValue, TerminalError> {
        let policy = RetryPolicy::from_config(&self.config);
        let mut last_err: Option<RecoverableError> = None;
        tracing::trace!(id, kind = %JobKind::Read, "starting job");

        for attempt in 0..policy.max_retries {
            let mut inner = self.inner.lock().await;
            self.ensure_connected(&mut inner).await?;

            let request = Datagram::new(Command::Read, id, Vec::new())
                .expect("empty read payload is always within the size limit");
            let outcome = match self.send(&mut inner, &request).await {
                Ok(()) => self.receive_matching(&mut inner, id).await,
                Err(e) => Err(e),
            };
            drop(inner);

            match outcome {
                Ok(dg) => {
                    self.cache.lock().await.put(id, dg.clone());
                    return RegisterValue::decode(wire_type, &dg.data, id);
                }
                Err(e) => {
                    tracing::debug!(id, attempt, error = %e, "read attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < policy.max_retries {
                        tokio::time::sleep(policy.backoff_after(attempt)).await;
                    }
                }
            }
        }

        Err(TerminalError::RetryExhausted {
            attempts: policy.max_retries,
            cause: last_err.expect("loop only exits via Ok(..) or after recording an error"),
        })
    }

    async fn write_with_retry(&self, id: u32, encoded: &[u8]) -> Result<(), TerminalError> {
        let policy = RetryPolicy::from_config(&self.config);
        let mut last_err: Option<RecoverableError> = None;
        tracing::trace!(id, kind = %JobKind::Write, "starting job");

        for attempt in 0..policy.max_retries {
            match self.write_once(id, encoded).await {
                Ok(()) => return Ok(()),
                Err(WriteAttemptError::Terminal(e)) => return Err(e),
                Err(WriteAttemptError::Recoverable(e)) => {
                    tracing::debug!(id, attempt, error = %e, "write attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < policy.max_retries {
                        tokio::time::sleep(policy.backoff_after(attempt)).await;
                    }
                }
            }
        }

        Err(TerminalError::RetryExhausted {
            attempts: policy.max_retries,
            cause: last_err.expect("loop only exits via Ok(..) or after recording an error"),
        })
    }

    async fn write_once(&self, id: u32, encoded: &[u8]) -> Result<(), WriteAttemptError> {
        let mut inner = self.inner.lock().await;
        self.ensure_connected(&mut inner)
            .await
            .map_err(WriteAttemptError::Terminal)?;

        if let Some(status_id) = self.config.status_register_id {
            self.check_device_ready(&mut inner, status_id).await?;
        }

        let write_dg = Datagram::new(Command::Write, id, encoded.to_vec())
            .expect("encoded payload already validated against the catalog's wire type");
        self.send(&mut inner, &write_dg)
            .await
            .map_err(WriteAttemptError::Recoverable)?;

        let verify_request = Datagram::new(Command::Read, id, Vec::new())
            .expect("empty read payload is always within the size limit");
        self.send(&mut inner, &verify_request)
            .await
            .map_err(WriteAttemptError::Recoverable)?;
        let verify_dg = self
            .receive_matching(&mut inner, id)
            .await
            .map_err(WriteAttemptError::Recoverable)?;

        if verify_dg.data != encoded {
            return Err(WriteAttemptError::Recoverable(
                RecoverableError::VerifyMismatch {
                    expected: encoded.to_vec(),
                    got: verify_dg.data,
                },
            ));
        }

        Ok(())
    }

    async fn check_device_ready(
        &self,
        inner: &mut ConnInner,
        status_id: u32,
    ) -> Result<(), WriteAttemptError> {
        let status_descriptor = *self
            .catalog
            .get(status_id)
            .ok_or(TerminalError::UnknownRegister(status_id))
            .map_err(WriteAttemptError::Terminal)?;

        let status_request = Datagram::new(Command::Read, status_id, Vec::new())
            .expect("empty read payload is always within the size limit");
        self.send(inner, &status_request)
            .await
            .map_err(WriteAttemptError::Recoverable)?;
        let status_dg = self
            .receive_matching(inner, status_id)
            .await
            .map_err(WriteAttemptError::Recoverable)?;
        let status_value =
            RegisterValue::decode(status_descriptor.wire_type, &status_dg.data, status_id)
                .map_err(WriteAttemptError::Terminal)?;

        let code = match status_value {
            RegisterValue::U8(b) => b,
            RegisterValue::U16(v) if v != 0 => 0xFF,
            RegisterValue::U32(v) if v != 0 => 0xFF,
            RegisterValue::F32(v) if v != 0.0 => 0xFF,
            RegisterValue::Str(ref s) if !s.is_empty() => 0xFF,
            _ => 0,
        };
        if code != 0 {
            return Err(WriteAttemptError::Terminal(TerminalError::DeviceNotReady(
                code,
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RegisterDescriptor, StaticCatalog, WireType};
    use crate::frame::encode as encode_frame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    static REGS: &[RegisterDescriptor] = &[
        RegisterDescriptor {
            id: 1,
            wire_type: WireType::Uint16Be,
            writable: true,
            label: "widget_count",
            validate: None,
        },
        RegisterDescriptor {
            id: 2,
            wire_type: WireType::Float32Be,
            writable: false,
            label: "solar_power",
            validate: None,
        },
        RegisterDescriptor {
            id: 10,
            wire_type: WireType::Uint16Be,
            writable: false,
            label: "slot_0",
            validate: None,
        },
        RegisterDescriptor {
            id: 11,
            wire_type: WireType::Uint16Be,
            writable: false,
            label: "slot_1",
            validate: None,
        },
        RegisterDescriptor {
            id: 12,
            wire_type: WireType::Uint16Be,
            writable: false,
            label: "slot_2",
            validate: None,
        },
        RegisterDescriptor {
            id: 13,
            wire_type: WireType::Uint16Be,
            writable: false,
            label: "slot_3",
            validate: None,
        },
        RegisterDescriptor {
            id: 14,
            wire_type: WireType::Uint16Be,
            writable: false,
            label: "slot_4",
            validate: None,
        },
        RegisterDescriptor {
            id: 99,
            wire_type: WireType::Uint8,
            writable: false,
            label: "battery_status",
            validate: None,
        },
        RegisterDescriptor {
            id: 50,
            wire_type: WireType::Uint16Be,
            writable: true,
            label: "limited_setpoint",
            validate: Some(|v| !matches!(v, RegisterValue::U16(n) if *n > 100)),
        },
    ];

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.receive_timeout = Duration::from_millis(500);
        cfg.initial_backoff = Duration::from_millis(5);
        cfg.max_retries = 3;
        cfg
    }

    /// Spawn a task that plays a minimal device: for every Read it sees,
    /// it replies with a Response carrying `body`.
    fn spawn_echo_device(mut half: tokio::io::DuplexStream, body: Vec<u8>) {
        tokio::spawn(async move {
            let decoder = FrameDecoder::new();
            let mut buf = BytesMut::new();
            loop {
                match decoder.decode_one(&buf) {
                    DecodeOutcome::Frame { datagram, consumed } => {
                        buf.advance(consumed);
                        let reply =
                            Datagram::new(Command::Response, datagram.id, body.clone()).unwrap();
                        if half.write_all(&encode_frame(&reply)).await.is_err() {
                            return;
                        }
                    }
                    DecodeOutcome::Recoverable { discard, .. } => buf.advance(discard),
                    DecodeOutcome::NeedMoreData => {
                        let mut tmp = [0u8; 256];
                        match half.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn query_reads_and_caches_a_register() {
        let (client_half, device_half) = tokio::io::duplex(1024);
        spawn_echo_device(device_half, vec![0x00, 0x2A]);

        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let value = conn.query(1).await.unwrap();
        assert_eq!(value, RegisterValue::U16(0x2A));

        // Second query should be served from cache without touching the
        // (now-silent) device task.
        let value = conn.query(1).await.unwrap();
        assert_eq!(value, RegisterValue::U16(0x2A));
    }

    #[tokio::test]
    async fn query_unknown_register_is_terminal_and_not_retried() {
        let (client_half, _device_half) = tokio::io::duplex(64);
        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let err = conn.query(0xDEAD).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Terminal(TerminalError::UnknownRegister(0xDEAD))
        ));
    }

    #[tokio::test]
    async fn write_rejects_non_writable_register() {
        let (client_half, _device_half) = tokio::io::duplex(64);
        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let err = conn.write(2, RegisterValue::F32(1.0)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Terminal(TerminalError::NotWritable(2))
        ));
    }

    #[tokio::test]
    async fn write_rejects_value_failing_validation_predicate_without_retry() {
        // Register 50's validate predicate rejects any value above 100; no
        // device is wired up at all, so a passing test here can only mean
        // the predicate failed fast before anything touched the wire.
        let (client_half, _device_half) = tokio::io::duplex(64);
        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let err = conn
            .write(50, RegisterValue::U16(101))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Terminal(TerminalError::ValidationRejected(50))
        ));
    }

    #[tokio::test]
    async fn write_verifies_round_trip_value() {
        let (client_half, device_half) = tokio::io::duplex(1024);
        // Echo device always answers with the bytes of the last Write it
        // saw (falling back to zero before any write arrives).
        tokio::spawn(async move {
            let decoder = FrameDecoder::new();
            let mut buf = BytesMut::new();
            let mut last_write = vec![0x00, 0x00];
            let mut half = device_half;
            loop {
                match decoder.decode_one(&buf) {
                    DecodeOutcome::Frame { datagram, consumed } => {
                        buf.advance(consumed);
                        match datagram.cmd {
                            Command::Write => last_write = datagram.data,
                            Command::Read => {
                                let reply = Datagram::new(
                                    Command::Response,
                                    datagram.id,
                                    last_write.clone(),
                                )
                                .unwrap();
                                if half.write_all(&encode_frame(&reply)).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                    DecodeOutcome::Recoverable { discard, .. } => buf.advance(discard),
                    DecodeOutcome::NeedMoreData => {
                        let mut tmp = [0u8; 256];
                        match half.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                }
            }
        });

        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        conn.write(1, RegisterValue::U16(7)).await.unwrap();
    }

    /// Spawn a device that answers reads of `status_id` with a fixed
    /// status byte and otherwise echoes the last Write it saw for any
    /// other id (same behavior as the plain round-trip echo device).
    /// `status_reads` counts how many times the status register was read,
    /// so a test can assert the pre-check ran exactly once and was never
    /// retried.
    fn spawn_status_aware_echo_device(
        mut half: tokio::io::DuplexStream,
        status_id: u32,
        status_byte: u8,
        status_reads: Arc<AtomicU32>,
    ) {
        tokio::spawn(async move {
            let decoder = FrameDecoder::new();
            let mut buf = BytesMut::new();
            let mut last_write = vec![0x00, 0x00];
            loop {
                match decoder.decode_one(&buf) {
                    DecodeOutcome::Frame { datagram, consumed } => {
                        buf.advance(consumed);
                        match datagram.cmd {
                            Command::Write => last_write = datagram.data,
                            Command::Read if datagram.id == status_id => {
                                status_reads.fetch_add(1, Ordering::SeqCst);
                                let reply = Datagram::new(
                                    Command::Response,
                                    status_id,
                                    vec![status_byte],
                                )
                                .unwrap();
                                if half.write_all(&encode_frame(&reply)).await.is_err() {
                                    return;
                                }
                            }
                            Command::Read => {
                                let reply = Datagram::new(
                                    Command::Response,
                                    datagram.id,
                                    last_write.clone(),
                                )
                                .unwrap();
                                if half.write_all(&encode_frame(&reply)).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                    DecodeOutcome::Recoverable { discard, .. } => buf.advance(discard),
                    DecodeOutcome::NeedMoreData => {
                        let mut tmp = [0u8; 256];
                        match half.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn write_precheck_rejects_device_not_ready_without_retry() {
        let (client_half, device_half) = tokio::io::duplex(1024);
        let status_reads = Arc::new(AtomicU32::new(0));
        spawn_status_aware_echo_device(device_half, 99, 0x01, Arc::clone(&status_reads));

        let mut cfg = test_config();
        cfg.status_register_id = Some(99);

        let conn = Connection::with_transport(
            "device.local",
            9000,
            cfg,
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let err = conn.write(1, RegisterValue::U16(7)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Terminal(TerminalError::DeviceNotReady(0x01))
        ));
        // Terminal errors are never retried: the status register is read
        // exactly once despite `max_retries` being 3 in `test_config()`.
        assert_eq!(status_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_precheck_passes_when_status_is_zero() {
        let (client_half, device_half) = tokio::io::duplex(1024);
        let status_reads = Arc::new(AtomicU32::new(0));
        spawn_status_aware_echo_device(device_half, 99, 0x00, Arc::clone(&status_reads));

        let mut cfg = test_config();
        cfg.status_register_id = Some(99);

        let conn = Connection::with_transport(
            "device.local",
            9000,
            cfg,
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        conn.write(1, RegisterValue::U16(7)).await.unwrap();
        assert_eq!(status_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn receive_timeout_is_retried_then_exhausts_as_terminal() {
        // A duplex whose peer half is simply dropped: every read blocks
        // until the client's receive_timeout fires, every attempt retries.
        let (client_half, device_half) = tokio::io::duplex(64);
        drop(device_half);

        let mut cfg = test_config();
        cfg.receive_timeout = Duration::from_millis(20);
        cfg.initial_backoff = Duration::from_millis(1);
        cfg.max_retries = 2;

        let conn = Connection::with_transport(
            "device.local",
            9000,
            cfg,
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let err = conn.query(1).await.unwrap_err();
        match err {
            Error::Terminal(TerminalError::RetryExhausted { attempts, .. }) => {
                assert_eq!(attempts, 2)
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_with_wrong_id_is_recoverable_and_retried() {
        // The device answers the first Read with a Response carrying a
        // different id (stale/desynced reply), then answers correctly on
        // the retried attempt.
        let (client_half, device_half) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let decoder = FrameDecoder::new();
            let mut buf = BytesMut::new();
            let mut half = device_half;
            let mut seen = 0u32;
            loop {
                match decoder.decode_one(&buf) {
                    DecodeOutcome::Frame { datagram, consumed } => {
                        buf.advance(consumed);
                        seen += 1;
                        let reply_id = if seen == 1 { datagram.id + 1 } else { datagram.id };
                        let reply =
                            Datagram::new(Command::Response, reply_id, vec![0x00, 0x2A]).unwrap();
                        if half.write_all(&encode_frame(&reply)).await.is_err() {
                            return;
                        }
                    }
                    DecodeOutcome::Recoverable { discard, .. } => buf.advance(discard),
                    DecodeOutcome::NeedMoreData => {
                        let mut tmp = [0u8; 256];
                        match half.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                }
            }
        });

        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let value = conn.query(1).await.unwrap();
        assert_eq!(value, RegisterValue::U16(0x2A));
    }

    #[tokio::test]
    async fn close_defers_while_a_job_is_active() {
        let (client_half, device_half) = tokio::io::duplex(1024);
        spawn_echo_device(device_half, vec![0x00, 0x01]);

        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        conn.active_jobs.fetch_add(1, Ordering::SeqCst);
        conn.close().await;
        assert!(!conn.is_closed().await, "close should be deferred");
        assert!(conn.pending_close.load(Ordering::SeqCst));

        conn.active_jobs.fetch_sub(1, Ordering::SeqCst);
        conn.maybe_finish_pending_close().await;
        assert!(conn.is_closed().await);
    }

    /// Spawn a device that, for every Read it sees, bumps a shared
    /// in-flight counter, sleeps `delay`, replies with the low 16 bits of
    /// the requested id, then drops the counter back down. Used to observe
    /// that the client never lets two requests overlap on the wire (spec
    /// property 5 / scenario S6).
    fn spawn_slow_echo_device(
        mut half: tokio::io::DuplexStream,
        delay: Duration,
        in_flight: Arc<AtomicU32>,
        max_in_flight: Arc<AtomicU32>,
    ) {
        tokio::spawn(async move {
            let decoder = FrameDecoder::new();
            let mut buf = BytesMut::new();
            loop {
                match decoder.decode_one(&buf) {
                    DecodeOutcome::Frame { datagram, consumed } => {
                        buf.advance(consumed);
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(delay).await;
                        let body = (datagram.id as u16).to_be_bytes().to_vec();
                        let reply = Datagram::new(Command::Response, datagram.id, body).unwrap();
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        if half.write_all(&encode_frame(&reply)).await.is_err() {
                            return;
                        }
                    }
                    DecodeOutcome::Recoverable { discard, .. } => buf.advance(discard),
                    DecodeOutcome::NeedMoreData => {
                        let mut tmp = [0u8; 256];
                        match half.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn property5_single_flight_with_concurrent_callers_preserves_order() {
        let (client_half, device_half) = tokio::io::duplex(4096);
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_in_flight = Arc::new(AtomicU32::new(0));
        spawn_slow_echo_device(
            device_half,
            Duration::from_millis(30),
            Arc::clone(&in_flight),
            Arc::clone(&max_in_flight),
        );

        let conn = Connection::with_transport(
            "device.local",
            9000,
            test_config(),
            Arc::new(StaticCatalog::new(REGS)),
            Duration::from_secs(5),
            16,
            Box::new(crate::transport::DuplexTransport::new(client_half)),
        );

        let ids = [10u32, 11, 12, 13, 14];
        let completion_order = Arc::new(Mutex::new(Vec::new()));

        let futures: Vec<_> = ids
            .iter()
            .map(|&id| {
                let conn = Arc::clone(&conn);
                let completion_order = Arc::clone(&completion_order);
                Box::pin(async move {
                    let value = conn.query(id).await.unwrap();
                    completion_order.lock().await.push(id);
                    assert_eq!(value, RegisterValue::U16(id as u16));
                })
            })
            .collect();

        futures::future::join_all(futures).await;

        assert_eq!(
            max_in_flight.load(Ordering::SeqCst),
            1,
            "at most one wire request should ever be in flight"
        );
        assert_eq!(*completion_order.lock().await, vec![10, 11, 12, 13, 14]);
    }
}
