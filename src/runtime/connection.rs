//! Connection state machine for echoing TCP connections.
//!
//! A connection drives two self re-arming operation chains on the shared
//! reactor: a read chain and a write chain. Each side of the socket is either
//! parked inside the connection guard or moved into its single in-flight
//! operation, so at most one read and one write can be outstanding.
//!
//! Every issuance of a read or write, every mutation of the outbound queue,
//! and every close goes through the one guard. The guard is never held across
//! a suspension point.

use crate::runtime::reactor::Reactor;
use crate::runtime::token::OpType;
use bytes::Bytes;
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Size of the per-connection read buffer.
///
/// A payload larger than this is received and echoed across several
/// read/write cycles.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Current state of a connection.
///
/// Connected moves to Error or Closed. Error and Closed are absorbing,
/// except that an errored connection is still closed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnStatus {
    Connected = 0,
    Error = 1,
    Closed = 2,
}

impl ConnStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnStatus::Connected,
            1 => ConnStatus::Error,
            _ => ConnStatus::Closed,
        }
    }
}

/// Outcome delivered to a completion handler.
#[derive(Debug)]
pub(crate) enum Completion<T> {
    /// The operation finished.
    Done(T),
    /// The handle was closed while the operation was outstanding.
    Cancelled,
    /// The operation failed.
    Failed(io::Error),
}

impl<T> From<io::Result<T>> for Completion<T> {
    fn from(res: io::Result<T>) -> Self {
        match res {
            Ok(v) => Completion::Done(v),
            Err(e) => Completion::Failed(e),
        }
    }
}

/// Read half of the socket together with its receive buffer.
struct ReadSide {
    stream: BoxedReader,
    buf: Box<[u8]>,
}

/// State protected by the connection guard.
struct Guarded {
    /// Parked read side. `None` while a read is in flight or after close.
    reader: Option<ReadSide>,
    /// Parked write side. `None` while a write is in flight or after close.
    writer: Option<BoxedWriter>,
    /// Pending outbound messages. The front is the one being written.
    outbound: VecDeque<Bytes>,
}

/// Gauge of in-flight operations of one kind, with its observed peak.
#[derive(Debug, Default)]
struct OpGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl OpGauge {
    fn enter(&self) {
        let prev = self.current.fetch_add(1, Ordering::AcqRel);
        self.peak.fetch_max(prev + 1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "second operation issued while one is outstanding");
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    close_actions: AtomicU64,
}

/// Snapshot of a connection's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Completed reads that delivered data.
    pub reads: u64,
    /// Completed writes.
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Highest number of reads ever outstanding at once.
    pub peak_reads_in_flight: usize,
    /// Highest number of writes ever outstanding at once.
    pub peak_writes_in_flight: usize,
    /// Number of times the socket was actually closed.
    pub close_actions: u64,
}

/// A single client connection.
pub struct Connection {
    id: usize,
    peer: Option<SocketAddr>,
    status: AtomicU8,
    started: AtomicBool,
    guard: Mutex<Guarded>,
    cancel: CancellationToken,
    reactor: Arc<Reactor>,
    reads_in_flight: OpGauge,
    writes_in_flight: OpGauge,
    counters: Counters,
}

impl Connection {
    /// Wrap an accepted TCP socket.
    pub fn from_tcp(id: usize, reactor: Arc<Reactor>, stream: TcpStream) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::new(id, reactor, reader, writer, peer)
    }

    /// Wrap the two halves of any bidirectional byte stream.
    pub fn new<R, W>(
        id: usize,
        reactor: Arc<Reactor>,
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id,
            peer,
            status: AtomicU8::new(ConnStatus::Connected as u8),
            started: AtomicBool::new(false),
            guard: Mutex::new(Guarded {
                reader: Some(ReadSide {
                    stream: Box::new(reader),
                    buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
                }),
                writer: Some(Box::new(writer)),
                outbound: VecDeque::new(),
            }),
            cancel: CancellationToken::new(),
            reactor,
            reads_in_flight: OpGauge::default(),
            writes_in_flight: OpGauge::default(),
            counters: Counters::default(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> ConnStatus {
        ConnStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Issue the first read. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guarded = self.lock();
        if let Some(side) = guarded.reader.take() {
            self.issue_read(&mut guarded, side);
        }
    }

    /// Queue `msg` for delivery. Messages go out in the order queued.
    pub fn echo_msg(self: &Arc<Self>, msg: Bytes) {
        debug!(conn_id = self.id, bytes = msg.len(), "Echo message");
        let mut guarded = self.lock();
        if self.cancel.is_cancelled() {
            trace!(conn_id = self.id, "Dropping message for closed connection");
            return;
        }
        guarded.outbound.push_back(msg);
        if guarded.outbound.len() == 1 {
            if let Some(writer) = guarded.writer.take() {
                self.issue_write(&mut guarded, writer);
            }
        }
    }

    /// Close the socket. Only the first call has an effect.
    ///
    /// Outstanding operations complete as cancelled and release their half
    /// of the socket.
    pub fn close(&self) {
        if self.status.swap(ConnStatus::Closed as u8, Ordering::AcqRel) == ConnStatus::Closed as u8 {
            return;
        }
        let mut guarded = self.lock();
        self.cancel.cancel();
        drop(guarded.reader.take());
        drop(guarded.writer.take());
        let pending = guarded.outbound.len();
        guarded.outbound.clear();
        drop(guarded);

        self.counters.close_actions.fetch_add(1, Ordering::AcqRel);
        info!(conn_id = self.id, peer = ?self.peer, pending, "Connection closed");
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            reads: self.counters.reads.load(Ordering::Acquire),
            writes: self.counters.writes.load(Ordering::Acquire),
            bytes_read: self.counters.bytes_read.load(Ordering::Acquire),
            bytes_written: self.counters.bytes_written.load(Ordering::Acquire),
            peak_reads_in_flight: self.reads_in_flight.peak(),
            peak_writes_in_flight: self.writes_in_flight.peak(),
            close_actions: self.counters.close_actions.load(Ordering::Acquire),
        }
    }

    /// Issue a read. The caller holds the guard.
    fn issue_read(self: &Arc<Self>, _guarded: &mut Guarded, mut side: ReadSide) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.reads_in_flight.enter();
        let conn = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.reactor.submit(OpType::Read { conn_id: self.id }, async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Completion::Cancelled,
                res = side.stream.read(&mut side.buf[..]) => Completion::from(res),
            };
            conn.reads_in_flight.exit();
            conn.on_read(side, outcome);
        });
    }

    fn on_read(self: Arc<Self>, side: ReadSide, outcome: Completion<usize>) {
        match outcome {
            Completion::Done(0) => {
                self.fail("read", io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            Completion::Done(n) => {
                self.counters.reads.fetch_add(1, Ordering::AcqRel);
                self.counters.bytes_read.fetch_add(n as u64, Ordering::AcqRel);
                let msg = Bytes::copy_from_slice(&side.buf[..n]);
                {
                    let mut guarded = self.lock();
                    self.issue_read(&mut guarded, side);
                }
                self.echo_msg(msg);
            }
            Completion::Cancelled => {
                trace!(conn_id = self.id, "Connection read canceled");
            }
            Completion::Failed(e) => self.fail("read", e),
        }
    }

    /// Write the front of the queue, or park the writer if the queue is
    /// empty. The caller holds the guard.
    fn issue_write(self: &Arc<Self>, guarded: &mut Guarded, mut writer: BoxedWriter) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(msg) = guarded.outbound.front().cloned() else {
            guarded.writer = Some(writer);
            return;
        };
        self.writes_in_flight.enter();
        let conn = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.reactor.submit(OpType::Write { conn_id: self.id }, async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Completion::Cancelled,
                res = writer.write_all(&msg) => Completion::from(res.map(|()| msg.len())),
            };
            conn.writes_in_flight.exit();
            conn.on_write(writer, outcome);
        });
    }

    fn on_write(self: Arc<Self>, writer: BoxedWriter, outcome: Completion<usize>) {
        match outcome {
            Completion::Done(n) => {
                self.counters.writes.fetch_add(1, Ordering::AcqRel);
                self.counters.bytes_written.fetch_add(n as u64, Ordering::AcqRel);
                let mut guarded = self.lock();
                guarded.outbound.pop_front();
                self.issue_write(&mut guarded, writer);
            }
            Completion::Cancelled => {
                trace!(conn_id = self.id, "Connection write canceled");
            }
            Completion::Failed(e) => self.fail("write", e),
        }
    }

    /// Connected -> Error. The first failure wins.
    fn fail(&self, op: &'static str, err: io::Error) {
        let won = self
            .status
            .compare_exchange(
                ConnStatus::Connected as u8,
                ConnStatus::Error as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !won {
            return;
        }
        if err.kind() == io::ErrorKind::UnexpectedEof {
            debug!(conn_id = self.id, op, "Peer closed connection");
        } else {
            warn!(conn_id = self.id, op, error = %err, "Connection error");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let stats = self.stats();
        debug!(
            conn_id = self.id,
            reads = stats.reads,
            writes = stats.writes,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "Connection released"
        );
    }
}

/// Registry of tracked connections using slab allocation.
///
/// All mutation happens under one mutex.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::with_capacity(max_connections.min(1024))),
            max_connections,
        }
    }

    /// Insert the connection built by `make`, which receives the new id.
    ///
    /// Returns `None` without calling `make` if the registry is at capacity.
    pub fn insert_with(
        &self,
        make: impl FnOnce(usize) -> Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        let mut entries = self.lock();
        if entries.len() >= self.max_connections {
            return None;
        }
        let entry = entries.0.vacant_entry();
        let conn = make(entry.key());
        entry.insert(Arc::clone(&conn));
        Some(conn)
    }

    /// Remove `conn` if it is tracked.
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        self.lock().remove(conn)
    }

    #[cfg(test)]
    pub fn contains(&self, conn: &Arc<Connection>) -> bool {
        self.lock().contains(conn)
    }

    /// Lock the registry for a compound inspection.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard(self.connections.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Close and untrack every connection.
    pub fn close_all(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        for conn in entries.0.drain() {
            conn.close();
        }
        count
    }

    /// Handles to every tracked connection at this instant.
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().0.iter().map(|(_, conn)| Arc::clone(conn)).collect()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

/// Exclusive access to the registry.
pub struct RegistryGuard<'a>(MutexGuard<'a, Slab<Arc<Connection>>>);

impl RegistryGuard<'_> {
    pub fn contains(&self, conn: &Arc<Connection>) -> bool {
        self.0
            .get(conn.id())
            .is_some_and(|entry| Arc::ptr_eq(entry, conn))
    }

    /// Remove `conn`, leaving any other connection that reuses its id alone.
    pub fn remove(&mut self, conn: &Arc<Connection>) -> bool {
        if self.contains(conn) {
            self.0.remove(conn.id());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
