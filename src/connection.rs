//! One supervised connection: a write loop, a reader task, and reconnects.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ─► Live ─► Erroring ─► Connecting ─► ...
//!      │          │
//!      └──────────┴─► ShuttingDown ─► Closed
//! ```
//!
//! The supervisor task dials through the configured [`Dialer`]. Each socket
//! gets a fresh [`InFlightRing`] and a fresh framer, so nothing from a dead
//! socket leaks into the next one. While a session is live the supervisor
//! runs the write loop itself and spawns the reader; whichever side fails
//! first closes the ring, which fails every batch still waiting on that
//! socket. Batches queued behind the failure are failed too, then the
//! supervisor dials again straight away. Only dial failures wait
//! `retry_duration` before the next attempt.
//!
//! The reader checks every header line as it is framed. A line that breaks
//! the grammar means the stream can no longer be trusted, so it fails the
//! session. `SERVER_ERROR` and `CLIENT_ERROR` stay with their own record.
//!
//! On shutdown the write half is closed and the reader gets
//! [`SHUTDOWN_DRAIN`] to collect outstanding replies before the ring is
//! closed under it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backpressure::WriteLimiter;
use crate::batch::{BatchResponses, CommandBatch, RecordSpan};
use crate::buffer_pool::BufferPool;
use crate::error::{MemcacheError, Result};
use crate::inflight::InFlightRing;
use crate::protocol::{parse_header, FrameBuffer};
use crate::transport::{with_deadline, BoxedStream, Dialer};
use crate::writer::{write_loop, Sender, WriteContext};

/// How long the reader may keep draining replies after a shutdown before
/// whatever is still in flight fails with `ConnectionClosed`.
pub(crate) const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

/// Supervisor state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Dialing, or waiting to redial after a failed dial.
    Connecting = 0,
    /// A socket is up and both loops are running.
    Live = 1,
    /// The last socket or dial failed; in-flight work is being failed.
    Erroring = 2,
    /// `shutdown()` was called; draining.
    ShuttingDown = 3,
    /// Both loops have exited.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Live,
            2 => ConnectionState::Erroring,
            3 => ConnectionState::ShuttingDown,
            _ => ConnectionState::Closed,
        }
    }
}

/// Per-connection settings taken from the client config.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionOptions {
    pub buffer_size: usize,
    pub write_limit: u64,
    pub in_flight_capacity: usize,
    pub max_value_size: usize,
    pub retry_duration: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Handle to a supervised connection.
///
/// Dropping the handle shuts the connection down in the background.
pub struct Connection {
    addr: String,
    sender: Sender,
    state: Arc<AtomicU8>,
    limiter: Arc<WriteLimiter>,
    shutdown: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Start the supervisor task. Must be called inside a tokio runtime.
    pub(crate) fn spawn(
        addr: String,
        dialer: Arc<dyn Dialer>,
        options: ConnectionOptions,
        pool: Arc<BufferPool>,
    ) -> Self {
        let (sender, rx) = Sender::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));
        let limiter = Arc::new(WriteLimiter::new(options.write_limit));

        let supervisor = Supervisor {
            addr: addr.clone(),
            dialer,
            options,
            pool,
            limiter: limiter.clone(),
            state: state.clone(),
            rx,
            shutdown: shutdown_rx,
            closed: closed_tx,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            addr,
            sender,
            state,
            limiter,
            shutdown: shutdown_tx,
            closed: closed_rx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Address this connection dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current supervisor state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sub-commands written but not yet read back on the current socket.
    pub fn outstanding(&self) -> u64 {
        self.limiter.outstanding()
    }

    pub(crate) fn publish(&self, batch: CommandBatch) {
        self.sender.publish(batch);
    }

    /// Ask the supervisor to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Live as u8,
            ConnectionState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shutdown.send_replace(true);
    }

    /// Wait until the supervisor and its reader have exited.
    pub async fn wait_close_completed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;

        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Supervisor task for {} failed: {}", self.addr, e);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

struct Supervisor {
    addr: String,
    dialer: Arc<dyn Dialer>,
    options: ConnectionOptions,
    pool: Arc<BufferPool>,
    limiter: Arc<WriteLimiter>,
    state: Arc<AtomicU8>,
    rx: mpsc::UnboundedReceiver<CommandBatch>,
    shutdown: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        tracing::info!("Connection to {} starting", self.addr);
        let mut pending = VecDeque::new();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let dialed = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                dialed = self.dialer.dial(&self.addr) => dialed,
            };
            let stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    let err = MemcacheError::from(e);
                    tracing::error!("Dial {} failed: {}", self.addr, err);
                    self.set_state(ConnectionState::Erroring);
                    if self.wait_retry(&err).await {
                        continue;
                    }
                    break;
                }
            };

            self.set_state(ConnectionState::Live);
            tracing::debug!("Connected to {}", self.addr);

            match self.run_session(stream, &mut pending).await {
                None => break,
                Some(err) => {
                    self.set_state(ConnectionState::Erroring);
                    tracing::warn!("Connection to {} lost, reconnecting: {}", self.addr, err);
                }
            }
        }

        self.set_state(ConnectionState::ShuttingDown);
        self.rx.close();
        let err = MemcacheError::ConnectionClosed;
        for batch in pending.drain(..) {
            batch.fail_chain(&err);
        }
        while let Ok(batch) = self.rx.try_recv() {
            batch.fail_chain(&err);
        }

        self.set_state(ConnectionState::Closed);
        self.closed.send_replace(true);
        tracing::info!("Connection to {} closed", self.addr);
    }

    /// Fail queued work with `err` until the retry delay elapses.
    ///
    /// Returns false if the connection should stop instead of redialing.
    async fn wait_retry(&mut self, err: &MemcacheError) -> bool {
        self.fail_queued(err);
        let delay = tokio::time::sleep(self.options.retry_duration);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return false,
                _ = &mut delay => return true,
                batch = self.rx.recv() => match batch {
                    Some(batch) => batch.fail_chain(err),
                    None => return false,
                },
            }
        }
    }

    fn fail_queued(&mut self, err: &MemcacheError) {
        while let Ok(batch) = self.rx.try_recv() {
            batch.fail_chain(err);
        }
    }

    /// Drive one socket until shutdown (`None`) or failure (`Some(err)`).
    async fn run_session(
        &mut self,
        stream: BoxedStream,
        pending: &mut VecDeque<CommandBatch>,
    ) -> Option<MemcacheError> {
        let ring = Arc::new(InFlightRing::new(self.options.in_flight_capacity));
        let (read_half, mut write_half) = tokio::io::split(stream);

        let mut reader = tokio::spawn(read_loop(
            read_half,
            ReadContext {
                ring: ring.clone(),
                limiter: self.limiter.clone(),
                pool: self.pool.clone(),
                buffer_size: self.options.buffer_size,
                max_value_size: self.options.max_value_size,
                read_timeout: self.options.read_timeout,
            },
        ));

        let outcome = {
            let ctx = WriteContext {
                limiter: &self.limiter,
                ring: &ring,
                write_timeout: self.options.write_timeout,
            };
            tokio::select! {
                written = write_loop(&mut write_half, &mut self.rx, pending, &mut self.shutdown, &ctx) => {
                    SessionEnd::Writer(written)
                }
                joined = &mut reader => SessionEnd::Reader(join_result(joined)),
            }
        };

        let err = match outcome {
            SessionEnd::Writer(Ok(())) => {
                ring.seal();
                if let Err(e) = write_half.shutdown().await {
                    tracing::debug!("Shutting down write half of {}: {}", self.addr, e);
                }
                let drained = tokio::time::timeout(SHUTDOWN_DRAIN, &mut reader).await;
                let drained = match drained {
                    Ok(joined) => join_result(joined),
                    Err(_) => {
                        tracing::warn!(
                            "Reader for {} still waiting after {:?}, closing",
                            self.addr,
                            SHUTDOWN_DRAIN
                        );
                        ring.close(MemcacheError::ConnectionClosed);
                        reader.abort();
                        let _ = reader.await;
                        Err(MemcacheError::ConnectionClosed)
                    }
                };
                if let Err(e) = drained {
                    tracing::debug!("Reader for {} ended with: {}", self.addr, e);
                }
                return None;
            }
            SessionEnd::Writer(Err(e)) => {
                tracing::error!("Write to {} failed: {}", self.addr, e);
                ring.close(e.clone());
                let _ = join_result(reader.await);
                e
            }
            SessionEnd::Reader(Ok(())) => {
                let e = MemcacheError::ConnectionClosed;
                ring.close(e.clone());
                e
            }
            SessionEnd::Reader(Err(e)) => {
                tracing::error!("Read loop error: {}", e);
                ring.close(e.clone());
                e
            }
        };

        for batch in pending.drain(..) {
            batch.fail_chain(&err);
        }
        self.fail_queued(&err);
        self.limiter.reset();
        Some(err)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

enum SessionEnd {
    Writer(Result<()>),
    Reader(Result<()>),
}

fn join_result(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| MemcacheError::broken_pipe(format!("reader task failed: {}", e)))?
}

struct ReadContext {
    ring: Arc<InFlightRing>,
    limiter: Arc<WriteLimiter>,
    pool: Arc<BufferPool>,
    buffer_size: usize,
    max_value_size: usize,
    read_timeout: Option<Duration>,
}

/// Pull batches off the ring in submission order and fill each one with
/// exactly `count` records.
async fn read_loop<R>(mut reader: R, ctx: ReadContext) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut framer = FrameBuffer::new(ctx.buffer_size, ctx.max_value_size);
    let mut scratch = vec![0u8; ctx.buffer_size.max(64)];

    while let Some(batch) = ctx.ring.pop().await? {
        match read_batch(&mut reader, &mut framer, &mut scratch, &ctx, batch.count).await {
            Ok(responses) => {
                if !batch.shared.complete_ok(responses, &ctx.pool) {
                    tracing::debug!("Batch completed after it was failed");
                }
                ctx.limiter.add_read_count(batch.count as u64);
            }
            Err(e) => {
                batch.shared.fail(e.clone());
                ctx.ring.close(e.clone());
                return Err(e);
            }
        }
    }
    Ok(())
}

async fn read_batch<R>(
    reader: &mut R,
    framer: &mut FrameBuffer,
    scratch: &mut [u8],
    ctx: &ReadContext,
    count: usize,
) -> Result<BatchResponses>
where
    R: AsyncRead + Unpin,
{
    let mut responses = BatchResponses::with_capacity(count, &ctx.pool);

    for _ in 0..count {
        let record = loop {
            if let Some(record) = framer.next_record()? {
                break record;
            }
            let n = tokio::select! {
                read = with_deadline(ctx.read_timeout, "read", async {
                    reader.read(scratch).await.map_err(MemcacheError::from)
                }) => read?,
                err = ctx.ring.closed() => return Err(err),
            };
            if n == 0 {
                return Err(MemcacheError::ConnectionClosed);
            }
            framer.push(&scratch[..n]);
        };

        let start = responses.bytes.len();
        let payload = match record.body_len {
            Some(len) => {
                let mut body = ctx.pool.acquire(len);
                framer
                    .read_out_parts(&mut responses.bytes, &mut body)
                    .ok_or_else(|| MemcacheError::broken_pipe("framed record vanished"))?;
                responses.payloads.push(body);
                Some(responses.payloads.len() - 1)
            }
            None => {
                framer
                    .read_out(&mut responses.bytes)
                    .ok_or_else(|| MemcacheError::broken_pipe("framed record vanished"))?;
                None
            }
        };
        let end = start + record.header_len;
        check_header(&responses.bytes[start..end])?;
        responses.records.push(RecordSpan {
            start,
            end,
            payload,
        });
    }

    Ok(responses)
}

/// Reject header lines that break the grammar. Server and client errors
/// belong to their record and are decoded when the caller resolves it.
fn check_header(line: &[u8]) -> Result<()> {
    match parse_header(line) {
        Err(e) if e.is_connection_fatal() => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::CommandBuilder;
    use crate::transport::BoxedStream;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, DuplexStream};

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            buffer_size: 64,
            write_limit: 1024,
            in_flight_capacity: 16,
            max_value_size: 1 << 20,
            retry_duration: Duration::from_millis(20),
            read_timeout: None,
            write_timeout: None,
        }
    }

    fn version_batch(n: usize) -> CommandBatch {
        let mut builder = CommandBuilder::new(128);
        for _ in 0..n {
            builder.push(crate::protocol::encode_version);
        }
        builder.seal().unwrap()
    }

    /// Dialer handing out the client ends of duplex pipes; the server ends
    /// arrive on the returned channel.
    fn duplex_dialer() -> (Arc<dyn Dialer>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = move |_addr: String| {
            let tx = tx.clone();
            async move {
                let (client, server) = duplex(4096);
                let _ = tx.send(server);
                Ok::<BoxedStream, std::io::Error>(Box::new(client))
            }
        };
        (Arc::new(dialer), rx)
    }

    async fn expect_bytes(server: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let batch = version_batch(2);
        let shared = batch.shared.clone();
        conn.publish(batch);

        expect_bytes(&mut server, b"version\r\nversion\r\n").await;
        server.write_all(b"VERSION 1.6\r\nVERSION 1.6\r\n").await.unwrap();

        shared.wait().await.unwrap();
        let line = shared.with_record(1, |line, _| Ok(line.to_vec())).unwrap();
        assert_eq!(line, b"VERSION 1.6\r\n");
        assert_eq!(conn.state(), ConnectionState::Live);

        conn.shutdown();
        conn.wait_close_completed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_responses_split_across_reads() {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let first = version_batch(1);
        let second = version_batch(2);
        let (s1, s2) = (first.shared.clone(), second.shared.clone());
        conn.publish(first);
        conn.publish(second);
        expect_bytes(&mut server, b"version\r\nversion\r\nversion\r\n").await;

        for piece in [&b"VERSION a\r\nVER"[..], b"SION b\r", b"\nVERSION c\r\n"] {
            server.write_all(piece).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        s1.wait().await.unwrap();
        s2.wait().await.unwrap();
        assert_eq!(
            s1.with_record(0, |l, _| Ok(l.to_vec())).unwrap(),
            b"VERSION a\r\n"
        );
        assert_eq!(
            s2.with_record(0, |l, _| Ok(l.to_vec())).unwrap(),
            b"VERSION b\r\n"
        );
        assert_eq!(
            s2.with_record(1, |l, _| Ok(l.to_vec())).unwrap(),
            b"VERSION c\r\n"
        );
        conn.shutdown();
        conn.wait_close_completed().await;
    }

    #[tokio::test]
    async fn test_reconnect_fails_in_flight_and_recovers() {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let lost = version_batch(1);
        let lost_shared = lost.shared.clone();
        conn.publish(lost);
        expect_bytes(&mut server, b"version\r\n").await;
        // Half a VA record, then the peer goes away.
        server.write_all(b"VA 10\r\nabc").await.unwrap();
        drop(server);

        let err = lost_shared.wait().await.unwrap_err();
        assert!(err.is_connection_fatal());

        let mut server = servers.recv().await.unwrap();
        let next = version_batch(1);
        let next_shared = next.shared.clone();
        conn.publish(next);
        expect_bytes(&mut server, b"version\r\n").await;
        server.write_all(b"VERSION 2\r\n").await.unwrap();
        next_shared.wait().await.unwrap();
        assert_eq!(
            next_shared.with_record(0, |l, _| Ok(l.to_vec())).unwrap(),
            b"VERSION 2\r\n"
        );

        conn.shutdown();
        conn.wait_close_completed().await;
    }

    #[tokio::test]
    async fn test_dial_failure_fails_queued_then_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut servers) = mpsc::unbounded_channel();
        let dialer = {
            let attempts = attempts.clone();
            move |_addr: String| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                async move {
                    if attempt == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "refused",
                        ));
                    }
                    let (client, server) = duplex(4096);
                    let _ = tx.send(server);
                    Ok::<BoxedStream, std::io::Error>(Box::new(client))
                }
            }
        };
        let conn = Connection::spawn(
            "mock".into(),
            Arc::new(dialer),
            options(),
            Arc::new(BufferPool::new()),
        );

        let early = version_batch(1);
        let early_shared = early.shared.clone();
        conn.publish(early);
        match early_shared.wait().await {
            Err(MemcacheError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("unexpected: {:?}", other),
        }

        let _server = tokio::time::timeout(Duration::from_secs(1), servers.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(attempts.load(Ordering::SeqCst) >= 2);

        conn.shutdown();
        conn.wait_close_completed().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_retry_wait() {
        let dialer = |_addr: String| async move {
            Err::<BoxedStream, _>(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        };
        let mut opts = options();
        opts.retry_duration = Duration::from_secs(3600);
        let conn = Connection::spawn(
            "mock".into(),
            Arc::new(dialer),
            opts,
            Arc::new(BufferPool::new()),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.shutdown();
        conn.shutdown();
        tokio::time::timeout(Duration::from_secs(1), conn.wait_close_completed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let late = version_batch(1);
        let late_shared = late.shared.clone();
        conn.publish(late);
        assert!(matches!(
            late_shared.wait().await,
            Err(MemcacheError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_response_is_connection_fatal() {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let batch = version_batch(1);
        let shared = batch.shared.clone();
        conn.publish(batch);
        expect_bytes(&mut server, b"version\r\n").await;
        server.write_all(b"VA x\r\n").await.unwrap();

        assert!(matches!(
            shared.wait().await,
            Err(MemcacheError::BrokenPipe { .. })
        ));
        // A new socket is dialed immediately.
        let _next = tokio::time::timeout(Duration::from_secs(1), servers.recv())
            .await
            .unwrap()
            .unwrap();
        conn.shutdown();
        conn.wait_close_completed().await;
    }

    async fn assert_redials_after(reply: &[u8]) {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let batch = version_batch(1);
        let shared = batch.shared.clone();
        conn.publish(batch);
        expect_bytes(&mut server, b"version\r\n").await;
        server.write_all(reply).await.unwrap();

        assert!(matches!(
            shared.wait().await,
            Err(MemcacheError::BrokenPipe { .. })
        ));
        let _next = tokio::time::timeout(Duration::from_secs(1), servers.recv())
            .await
            .unwrap()
            .unwrap();
        conn.shutdown();
        conn.wait_close_completed().await;
    }

    #[tokio::test]
    async fn test_unknown_status_code_redials() {
        assert_redials_after(b"ZZ garbage\r\n").await;
    }

    #[tokio::test]
    async fn test_bad_cas_token_redials() {
        assert_redials_after(b"HD cABC\r\n").await;
    }

    #[tokio::test]
    async fn test_server_error_stays_with_record() {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let batch = version_batch(2);
        let shared = batch.shared.clone();
        conn.publish(batch);
        expect_bytes(&mut server, b"version\r\nversion\r\n").await;
        server
            .write_all(b"SERVER_ERROR busy\r\nVERSION 1\r\n")
            .await
            .unwrap();

        shared.wait().await.unwrap();
        assert!(matches!(
            shared.with_record(0, |line, _| parse_header(line)),
            Err(MemcacheError::ServerError { .. })
        ));
        assert_eq!(
            shared.with_record(1, |l, _| Ok(l.to_vec())).unwrap(),
            b"VERSION 1\r\n"
        );
        assert_eq!(conn.state(), ConnectionState::Live);
        assert!(servers.try_recv().is_err());

        conn.shutdown();
        conn.wait_close_completed().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_silent_peer() {
        let (dialer, mut servers) = duplex_dialer();
        let mut opts = options();
        opts.write_limit = 1;
        let conn = Connection::spawn("mock".into(), dialer, opts, Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let written = version_batch(1);
        let written_shared = written.shared.clone();
        conn.publish(written);
        expect_bytes(&mut server, b"version\r\n").await;

        // Held back by the write limit until a reply that never comes.
        let held = version_batch(1);
        let held_shared = held.shared.clone();
        conn.publish(held);
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.shutdown();
        tokio::time::timeout(Duration::from_secs(2), conn.wait_close_completed())
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            written_shared.wait().await,
            Err(MemcacheError::ConnectionClosed)
        ));
        assert!(matches!(
            held_shared.wait().await,
            Err(MemcacheError::ConnectionClosed)
        ));
        drop(server);
    }

    #[tokio::test]
    async fn test_shutdown_drains_replies_in_flight() {
        let (dialer, mut servers) = duplex_dialer();
        let conn = Connection::spawn("mock".into(), dialer, options(), Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let batch = version_batch(1);
        let shared = batch.shared.clone();
        conn.publish(batch);
        expect_bytes(&mut server, b"version\r\n").await;

        conn.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"VERSION 3\r\n").await.unwrap();

        shared.wait().await.unwrap();
        conn.wait_close_completed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_write_limit_holds_back_commands() {
        let (dialer, mut servers) = duplex_dialer();
        let mut opts = options();
        opts.write_limit = 2;
        let conn = Connection::spawn("mock".into(), dialer, opts, Arc::new(BufferPool::new()));
        let mut server = servers.recv().await.unwrap();

        let batches: Vec<_> = (0..3).map(|_| version_batch(1)).collect();
        let shared: Vec<_> = batches.iter().map(|b| b.shared.clone()).collect();
        let mut batches = batches.into_iter();

        conn.publish(batches.next().unwrap());
        expect_bytes(&mut server, b"version\r\n").await;
        conn.publish(batches.next().unwrap());
        conn.publish(batches.next().unwrap());

        // Two commands outstanding: the third stays queued.
        expect_bytes(&mut server, b"version\r\n").await;
        let mut byte = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(50), server.read(&mut byte))
                .await
                .is_err()
        );

        server.write_all(b"VERSION 1\r\n").await.unwrap();
        expect_bytes(&mut server, b"version\r\n").await;
        server
            .write_all(b"VERSION 2\r\nVERSION 3\r\n")
            .await
            .unwrap();
        for s in &shared {
            s.wait().await.unwrap();
        }
        assert_eq!(
            shared[2].with_record(0, |l, _| Ok(l.to_vec())).unwrap(),
            b"VERSION 3\r\n"
        );

        conn.shutdown();
        conn.wait_close_completed().await;
    }
}
