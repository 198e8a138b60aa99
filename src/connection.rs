//! A single client session.
//!
//! The connection owns both halves of its socket until the pumps take them,
//! the bounded outbound queue, and the close signal. Activity time, health
//! status and deadlines are interior-mutable so the reader, the writer, the
//! health sweep and route handlers can all touch one `Arc<Connection>`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ConnError, FrameError};
use crate::message::{Message, TCP_KIND};

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Read side handed to the reader pump.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side handed to the writer pump.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Health status of a connection.
///
/// Nominal values are `ACTIVE > TIMEOUT > CLOSE`; anything below `CLOSE`
/// marks the connection for eviction on the next sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnStat(pub i32);

impl ConnStat {
    pub const ACTIVE: ConnStat = ConnStat(2);
    pub const TIMEOUT: ConnStat = ConnStat(1);
    pub const CLOSE: ConnStat = ConnStat(0);

    /// Below `CLOSE`: the sweep removes the connection.
    pub fn is_evictable(self) -> bool {
        self < ConnStat::CLOSE
    }

    /// One step down after a failed probe.
    pub fn decay(self) -> ConnStat {
        ConnStat(self.0.saturating_sub(1))
    }

    /// One step up after a successful probe, capped at `ACTIVE`.
    pub fn recover(self) -> ConnStat {
        ConnStat(self.0.saturating_add(1).min(ConnStat::ACTIVE.0))
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("end of stream")]
    EndOfStream,
    #[error("framing error: {0}")]
    Frame(String),
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),
    #[error("activity check failed")]
    Unhealthy,
    #[error("evicted by health sweep")]
    Evicted,
    #[error("connection establishment timed out")]
    ConnectTimeout,
    #[error("hook failed: {0}")]
    Hook(String),
    #[error("registration rejected: {0}")]
    Rejected(String),
    #[error("message pool: {0}")]
    Pool(String),
    #[error("closed on request")]
    Requested,
    #[error("server stopping")]
    ServerStop,
}

impl From<FrameError> for CloseReason {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::EndOfStream => CloseReason::EndOfStream,
            FrameError::Timeout(op) => CloseReason::Timeout(op),
            other => CloseReason::Frame(other.to_string()),
        }
    }
}

/// One live client session.
pub struct Connection {
    conn_id: i32,
    conn_type: &'static str,
    peer_addr: Option<SocketAddr>,
    reader: Mutex<Option<BoxReader>>,
    sender: Mutex<Option<BoxWriter>>,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    last_active: Mutex<Instant>,
    stat: AtomicI32,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    closed: AtomicBool,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl Connection {
    /// Wrap an accepted TCP socket.
    pub fn new(stream: TcpStream, conn_id: i32) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::from_io(conn_id, TCP_KIND, peer_addr, reader, writer)
    }

    /// Wrap an arbitrary byte stream split into read and write halves.
    pub fn from_io<R, W>(
        conn_id: i32,
        conn_type: &'static str,
        peer_addr: Option<SocketAddr>,
        reader: R,
        writer: W,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (close_tx, _) = watch::channel(None);
        Self {
            conn_id,
            conn_type,
            peer_addr,
            reader: Mutex::new(Some(Box::new(reader))),
            sender: Mutex::new(Some(Box::new(writer))),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            last_active: Mutex::new(Instant::now()),
            stat: AtomicI32::new(ConnStat::ACTIVE.0),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    pub fn conn_id(&self) -> i32 {
        self.conn_id
    }

    pub fn conn_type(&self) -> &'static str {
        self.conn_type
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Hand the read half to the reader pump. Returns `None` once taken.
    pub fn take_reader(&self) -> Option<BoxReader> {
        self.reader.lock().take()
    }

    /// Hand the write half to the writer pump. Returns `None` once taken.
    pub fn take_sender(&self) -> Option<BoxWriter> {
        self.sender.lock().take()
    }

    /// Hand the outbound queue's receiving end to the writer pump.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.outbound_rx.lock().take()
    }

    /// True iff the last activity is more recent than `timeout`.
    ///
    /// A zero timeout disables the check.
    pub fn check_health(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return true;
        }
        self.last_active.lock().elapsed() < timeout
    }

    pub fn update_last_active_time(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Enqueue a message, waiting while the queue is full.
    pub async fn send_message(&self, msg: Message) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed(self.conn_id));
        }
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| ConnError::Closed(self.conn_id))
    }

    /// Enqueue without waiting.
    pub fn try_send_message(&self, msg: Message) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed(self.conn_id));
        }
        self.outbound_tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnError::QueueFull(self.conn_id),
            mpsc::error::TrySendError::Closed(_) => ConnError::Closed(self.conn_id),
        })
    }

    /// Number of messages waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        OUTBOUND_QUEUE_CAPACITY - self.outbound_tx.capacity()
    }

    /// Release the socket and wake every close waiter.
    ///
    /// Only the first call has an effect; returns whether it was this one.
    /// Halves already handed to the pumps are released when the pumps exit.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(conn_id = self.conn_id, reason = %reason, "Connection closed");
        self.reader.lock().take();
        self.sender.lock().take();
        self.outbound_rx.lock().take();
        self.signal_close(reason);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver a close reason. The first reason wins; later ones are ignored.
    pub fn signal_close(&self, reason: CloseReason) -> bool {
        self.close_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// The close reason, if one has been delivered.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_tx.borrow().clone()
    }

    /// Resolve once a close reason has been delivered.
    pub async fn wait_for_closed(&self) -> CloseReason {
        let mut rx = self.close_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(CloseReason::ServerStop)
    }

    pub fn stat(&self) -> ConnStat {
        ConnStat(self.stat.load(Ordering::Acquire))
    }

    pub fn set_stat(&self, stat: ConnStat) {
        self.stat.store(stat.0, Ordering::Release);
    }

    /// Atomically apply `f` to the status, returning the new value.
    pub fn update_stat(&self, f: impl Fn(ConnStat) -> ConnStat) -> ConnStat {
        let prev = self
            .stat
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(f(ConnStat(s)).0))
            .unwrap_or_else(|s| s);
        f(ConnStat(prev))
    }

    /// Arm both read and write deadlines `timeout` from now.
    pub fn set_deadline(&self, timeout: Duration) {
        self.set_read_deadline(timeout);
        self.set_write_deadline(timeout);
    }

    pub fn set_read_deadline(&self, timeout: Duration) {
        *self.read_deadline.lock() = Some(Instant::now() + timeout);
    }

    pub fn set_write_deadline(&self, timeout: Duration) {
        *self.write_deadline.lock() = Some(Instant::now() + timeout);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        *self.read_deadline.lock()
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        *self.write_deadline.lock()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("conn_type", &self.conn_type)
            .field("peer_addr", &self.peer_addr)
            .field("stat", &self.stat())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_conn(conn_id: i32) -> Connection {
    let (a, b) = tokio::io::duplex(1024);
    let (reader, _) = tokio::io::split(a);
    let (_, writer) = tokio::io::split(b);
    Connection::from_io(conn_id, "test", None, reader, writer)
}
