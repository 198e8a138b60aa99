//! TCP server: accept loop, per-connection supervisor and the two pumps.
//!
//! Each accepted socket gets a supervisor task that registers the connection,
//! starts a reader and a writer pump under a child cancellation token, then
//! waits for either a close signal or server shutdown before tearing the
//! connection down. Every task is spawned on one [`TaskTracker`], so
//! [`Server::stop`] returns only after every connection has been removed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{BoxReader, BoxWriter, CloseReason, Connection};
use crate::error::{ConfigError, FrameError};
use crate::manager::ConnManager;
use crate::message::{read_message, write_message, Message, MessagePool, TCP_KIND};
use crate::router::Router;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Minimum time a cancelled writer gets to flush queued frames.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Framed TCP server.
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    manager: Arc<ConnManager>,
    router: Arc<Router>,
    pool: MessagePool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        manager: Arc<ConnManager>,
        router: Arc<Router>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Server {
            inner: Arc::new(Inner {
                config,
                manager,
                router,
                pool: MessagePool::new([TCP_KIND]),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                local_addr: Mutex::new(None),
            }),
        })
    }

    pub fn manager(&self) -> &Arc<ConnManager> {
        &self.inner.manager
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Bind the listener and spawn the accept loop and the health sweep.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub fn start(&self) -> io::Result<SocketAddr> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "server already started",
            ));
        }

        let addr = SocketAddr::new(inner.config.ip, inner.config.port);
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        *inner.local_addr.lock() = Some(local_addr);

        info!(
            name = %inner.config.name,
            address = %local_addr,
            max_connections = inner.manager.config().max_connections,
            "Server listening"
        );

        let manager = Arc::clone(&inner.manager);
        let cancel = inner.shutdown.clone();
        inner
            .tracker
            .spawn(async move { manager.check_healths(cancel).await });

        inner.tracker.spawn(accept_loop(Arc::clone(inner), listener));
        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait for all tasks.
    pub async fn stop(&self) {
        let inner = &self.inner;
        info!(name = %inner.config.name, "Stopping server");
        inner.shutdown.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;
        info!(
            name = %inner.config.name,
            remaining = inner.manager.conn_count(),
            "Server stopped"
        );
    }
}

/// Create a listening socket with SO_REUSEADDR and a 1024 backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => {
                debug!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let accepted_at = Instant::now();
                    trace!(peer = %peer, "Accepted socket");
                    let supervisor = supervise(Arc::clone(&inner), stream, peer, accepted_at);
                    inner.tracker.spawn(supervisor);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Own one connection from registration to removal.
async fn supervise(inner: Arc<Inner>, stream: TcpStream, peer: SocketAddr, accepted_at: Instant) {
    let manager = &inner.manager;
    let conn_id = manager.allocate_conn_id();

    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
    }
    let conn = Arc::new(Connection::new(stream, conn_id));

    if let Some(hook) = manager.hook() {
        if let Err(e) = hook.before_connect(&conn) {
            warn!(conn_id, peer = %peer, error = %e, "Connection refused by hook");
            conn.close(CloseReason::Hook(e.to_string()));
            return;
        }
    }

    if let Err(e) = manager.add_conn(Arc::clone(&conn)) {
        warn!(conn_id, peer = %peer, error = %e, "Connection rejected");
        conn.close(CloseReason::Rejected(e.to_string()));
        return;
    }

    let connect_timeout = manager.config().timeout("connection_timeout");
    if !connect_timeout.is_zero() && Instant::now() >= accepted_at + connect_timeout {
        warn!(conn_id, peer = %peer, "Connection establishment timed out");
        manager.remove_conn(&conn, CloseReason::ConnectTimeout);
        return;
    }

    let (Some(reader), Some(writer), Some(outbound)) =
        (conn.take_reader(), conn.take_sender(), conn.take_outbound())
    else {
        // Closed between registration and here, e.g. by the health sweep.
        let reason = conn.close_reason().unwrap_or(CloseReason::Requested);
        manager.remove_conn(&conn, reason);
        return;
    };

    let cancel = inner.shutdown.child_token();
    let reader_task = inner.tracker.spawn(read_pump(
        Arc::clone(&inner),
        Arc::clone(&conn),
        reader,
        cancel.clone(),
    ));
    let writer_task = inner.tracker.spawn(write_pump(
        Arc::clone(manager),
        Arc::clone(&conn),
        writer,
        outbound,
        cancel.clone(),
    ));

    if let Some(hook) = manager.hook() {
        if let Err(e) = hook.after_connect(&conn) {
            warn!(conn_id, error = %e, "after_connect hook failed");
            conn.signal_close(CloseReason::Hook(e.to_string()));
        }
    }

    debug!(conn_id, peer = %peer, count = manager.conn_count(), "Connection established");

    let reason = tokio::select! {
        _ = inner.shutdown.cancelled() => CloseReason::ServerStop,
        reason = conn.wait_for_closed() => reason,
    };

    cancel.cancel();
    let (read_join, write_join) = tokio::join!(reader_task, writer_task);
    if let Err(e) = read_join {
        error!(conn_id, error = %e, "Reader task failed");
    }
    if let Err(e) = write_join {
        error!(conn_id, error = %e, "Writer task failed");
    }

    manager.remove_conn(&conn, reason.clone());

    if let Some(hook) = manager.hook() {
        if let Err(e) = hook.on_close(&conn) {
            warn!(conn_id, error = %e, "on_close hook failed");
        }
    }
    debug!(conn_id, reason = %reason, count = manager.conn_count(), "Connection finished");
}

/// Decode frames in wire order and dispatch each to its route.
async fn read_pump(
    inner: Arc<Inner>,
    conn: Arc<Connection>,
    mut reader: BoxReader,
    cancel: CancellationToken,
) {
    let manager = &inner.manager;
    let conn_id = conn.conn_id();
    let detection_timeout = manager.config().timeout("detection_timeout");
    let max_frame = manager.max_frame_size();
    let mut buf = BytesMut::with_capacity(manager.read_buffer());

    loop {
        if !conn.check_health(detection_timeout) {
            debug!(conn_id, "Connection idle past detection timeout");
            conn.signal_close(CloseReason::Unhealthy);
            break;
        }

        let mut msg = match inner.pool.acquire(TCP_KIND) {
            Ok(msg) => msg,
            Err(e) => {
                error!(conn_id, error = %e, "Message pool unavailable");
                conn.signal_close(CloseReason::Pool(e.to_string()));
                break;
            }
        };

        arm_read_deadline(manager, &conn);
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            read = read_message(&mut reader, &mut buf, &mut msg, max_frame, conn.read_deadline()) => Some(read),
        };
        let Some(read) = read else {
            recycle(&inner.pool, conn_id, msg);
            break;
        };
        if let Err(e) = read {
            if matches!(e, FrameError::EndOfStream) {
                debug!(conn_id, "Peer closed the stream");
            } else {
                debug!(conn_id, error = %e, "Read failed");
            }
            conn.signal_close(e.into());
            recycle(&inner.pool, conn_id, msg);
            break;
        }

        conn.update_last_active_time();
        let route_id = msg.route_id();
        trace!(
            conn_id,
            route_id,
            message_id = msg.message_id(),
            length = msg.length(),
            "Message received"
        );

        let dispatch =
            inner
                .router
                .handle_message(route_id, conn_id, msg.message_id(), msg.body().clone());
        let handled = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = dispatch => {
                if let Err(e) = result {
                    warn!(conn_id, route_id, error = %e, "Message handling failed");
                }
                true
            }
        };

        recycle(&inner.pool, conn_id, msg);
        if !handled {
            break;
        }
    }
    trace!(conn_id, "Reader stopped");
}

fn recycle(pool: &MessagePool, conn_id: i32, msg: Message) {
    if let Err(e) = pool.release(TCP_KIND, msg) {
        debug!(conn_id, error = %e, "Message not returned to pool");
    }
}

/// Write queued messages in enqueue order until cancelled.
///
/// Once cancelled, the frame in flight and whatever is still queued must
/// reach the socket before the shutdown grace deadline; the rest is dropped.
async fn write_pump(
    manager: Arc<ConnManager>,
    conn: Arc<Connection>,
    writer: BoxWriter,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    let conn_id = conn.conn_id();
    let mut writer = BufWriter::with_capacity(manager.write_buffer(), writer);
    let mut grace: Option<Instant> = None;

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let sent = {
            let write = send_frame(&manager, &conn, &mut writer, &msg, None);
            tokio::pin!(write);
            let finished = tokio::select! {
                sent = &mut write => Some(sent),
                _ = cancel.cancelled() => None,
            };
            match finished {
                Some(sent) => sent,
                None => {
                    let deadline = shutdown_deadline(&manager);
                    grace = Some(deadline);
                    timeout_at(deadline, write)
                        .await
                        .unwrap_or(Err(FrameError::Timeout("shutdown")))
                }
            }
        };

        if let Err(e) = sent {
            let dropped = 1 + discard(&mut outbound);
            warn!(conn_id, dropped, error = %e, "Write failed, outbound frames dropped");
            conn.signal_close(e.into());
            trace!(conn_id, "Writer stopped");
            return;
        }
    }

    let deadline = grace.unwrap_or_else(|| shutdown_deadline(&manager));
    drain(&manager, &conn, &mut writer, &mut outbound, deadline).await;
    trace!(conn_id, "Writer stopped");
}

/// Flush whatever is still queued, then half-close, all before `deadline`.
async fn drain(
    manager: &ConnManager,
    conn: &Connection,
    writer: &mut BufWriter<BoxWriter>,
    outbound: &mut mpsc::Receiver<Message>,
    deadline: Instant,
) {
    let conn_id = conn.conn_id();
    let mut drained = 0usize;
    while let Ok(msg) = outbound.try_recv() {
        if let Err(e) = send_frame(manager, conn, writer, &msg, Some(deadline)).await {
            let dropped = 1 + discard(outbound);
            warn!(conn_id, drained, dropped, error = %e, "Outbound queue not fully drained");
            return;
        }
        drained += 1;
    }
    if drained > 0 {
        trace!(conn_id, drained, "Drained outbound queue");
    }
    let _ = timeout_at(deadline, writer.shutdown()).await;
}

/// Empty the queue without writing. Returns how many frames were dropped.
fn discard(outbound: &mut mpsc::Receiver<Message>) -> usize {
    let mut dropped = 0;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// Write one frame under the connection's write deadline, tightened to
/// `limit` when one is given.
async fn send_frame(
    manager: &ConnManager,
    conn: &Connection,
    writer: &mut BufWriter<BoxWriter>,
    msg: &Message,
    limit: Option<Instant>,
) -> Result<(), FrameError> {
    arm_write_deadline(manager, conn);
    let deadline = match (conn.write_deadline(), limit) {
        (Some(at), Some(limit)) => Some(at.min(limit)),
        (at, limit) => at.or(limit),
    };
    write_message(writer, msg, deadline).await?;
    trace!(
        conn_id = conn.conn_id(),
        route_id = msg.route_id(),
        message_id = msg.message_id(),
        "Message sent"
    );
    Ok(())
}

/// Last instant a cancelled writer may spend flushing: the write timeout,
/// but never less than [`SHUTDOWN_GRACE`].
fn shutdown_deadline(manager: &ConnManager) -> Instant {
    let config = manager.config();
    let readwrite = config.timeout("readwrite_timeout");
    let write = if readwrite.is_zero() {
        config.timeout("write_timeout")
    } else {
        readwrite
    };
    Instant::now() + write.max(SHUTDOWN_GRACE)
}

/// `readwrite_timeout` rolls both deadlines and overrides `read_timeout`.
fn arm_read_deadline(manager: &ConnManager, conn: &Connection) {
    let config = manager.config();
    let readwrite = config.timeout("readwrite_timeout");
    if !readwrite.is_zero() {
        conn.set_deadline(readwrite);
        return;
    }
    let read = config.timeout("read_timeout");
    if !read.is_zero() {
        conn.set_read_deadline(read);
    }
}

fn arm_write_deadline(manager: &ConnManager, conn: &Connection) {
    let config = manager.config();
    let readwrite = config.timeout("readwrite_timeout");
    if !readwrite.is_zero() {
        conn.set_deadline(readwrite);
        return;
    }
    let write = config.timeout("write_timeout");
    if !write.is_zero() {
        conn.set_write_deadline(write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::error::{HandlerError, HookError};
    use crate::hook::ConnHook;
    use crate::message::encode;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    fn test_server(manager_config: ManagerConfig) -> Server {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let manager = Arc::new(ConnManager::new(manager_config).unwrap());
        let router = Arc::new(Router::new());
        Server::new(config, manager, router).unwrap()
    }

    fn register_echo(server: &Server, route_id: i32) {
        let manager = Arc::clone(server.manager());
        server
            .router()
            .register_route(route_id, move |message_id, conn_id, body| {
                let manager = Arc::clone(&manager);
                async move {
                    let conn = manager.find_conn(conn_id)?;
                    conn.send_message(Message::new(body, message_id, route_id))
                        .await?;
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
    }

    async fn send(client: &mut TcpStream, msg: &Message) {
        let mut buf = BytesMut::new();
        encode(msg, &mut buf).unwrap();
        client.write_all(&buf).await.unwrap();
    }

    async fn recv(client: &mut TcpStream, buf: &mut BytesMut) -> Message {
        let mut msg = Message::default();
        read_message(client, buf, &mut msg, 1024 * 1024, None)
            .await
            .unwrap();
        msg
    }

    async fn wait_for_count(server: &Server, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.manager().conn_count() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Read until the server closes the socket.
    async fn expect_closed(client: &mut TcpStream) {
        let mut scratch = [0u8; 64];
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.read(&mut scratch).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(result.is_ok(), "socket was not closed");
    }

    #[tokio::test]
    async fn test_ordered_delivery() {
        let server = test_server(ManagerConfig::default());
        register_echo(&server, 5);
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        for id in 1..=3 {
            send(&mut client, &Message::new(format!("m{id}"), id, 5)).await;
        }

        let mut buf = BytesMut::new();
        for id in 1..=3 {
            let msg = recv(&mut client, &mut buf).await;
            assert_eq!(msg.message_id(), id);
            assert_eq!(msg.route_id(), 5);
            assert_eq!(msg.body().as_ref(), format!("m{id}").as_bytes());
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_removes_all() {
        let server = test_server(ManagerConfig::default());
        let addr = server.start().unwrap();

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 2).await;

        server.stop().await;
        assert_eq!(server.manager().conn_count(), 0);
        assert!(server.manager().all_conns().is_empty());

        expect_closed(&mut a).await;
        expect_closed(&mut b).await;
    }

    #[tokio::test]
    async fn test_capacity_rejection() {
        let server = test_server(ManagerConfig {
            max_connections: 1,
            ..ManagerConfig::default()
        });
        let addr = server.start().unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        expect_closed(&mut second).await;
        assert_eq!(server.manager().conn_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_route_keeps_connection() {
        let server = test_server(ManagerConfig::default());
        register_echo(&server, 5);
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        send(&mut client, &Message::new("lost", 1, 42)).await;
        send(&mut client, &Message::new("kept", 2, 5)).await;

        let mut buf = BytesMut::new();
        let msg = recv(&mut client, &mut buf).await;
        assert_eq!(msg.message_id(), 2);
        assert_eq!(server.manager().conn_count(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let server = test_server(ManagerConfig {
            max_frame_size: 8,
            ..ManagerConfig::default()
        });
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;
        send(&mut client, &Message::new("far too long", 1, 1)).await;

        expect_closed(&mut client).await;
        wait_for_count(&server, 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_read_deadline_closes_idle_client() {
        let server = test_server(ManagerConfig {
            read_timeout: 1,
            ..ManagerConfig::default()
        });
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;

        expect_closed(&mut client).await;
        wait_for_count(&server, 0).await;
        server.stop().await;
    }

    #[derive(Default)]
    struct CountingHook {
        refuse: bool,
        veto: bool,
        connected: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ConnHook for CountingHook {
        fn before_connect(&self, _conn: &Connection) -> Result<(), HookError> {
            if self.refuse {
                return Err(HookError("refused".to_string()));
            }
            Ok(())
        }

        fn after_connect(&self, _conn: &Connection) -> Result<(), HookError> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            if self.veto {
                return Err(HookError("vetoed".to_string()));
            }
            Ok(())
        }

        fn on_close(&self, _conn: &Connection) -> Result<(), HookError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_run_around_lifecycle() {
        let server = test_server(ManagerConfig::default());
        let hook = Arc::new(CountingHook::default());
        let dyn_hook: Arc<dyn ConnHook> = hook.clone();
        server.manager().set_hook(Some(dyn_hook));
        let addr = server.start().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;
        drop(client);
        wait_for_count(&server, 0).await;

        server.stop().await;
        assert_eq!(hook.connected.load(Ordering::SeqCst), 1);
        assert_eq!(hook.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_before_connect_refusal() {
        let server = test_server(ManagerConfig::default());
        let hook = Arc::new(CountingHook {
            refuse: true,
            ..CountingHook::default()
        });
        let dyn_hook: Arc<dyn ConnHook> = hook.clone();
        server.manager().set_hook(Some(dyn_hook));
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect_closed(&mut client).await;

        server.stop().await;
        assert_eq!(server.manager().conn_count(), 0);
        assert_eq!(hook.connected.load(Ordering::SeqCst), 0);
        assert_eq!(hook.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_after_connect_veto_closes_connection() {
        let server = test_server(ManagerConfig::default());
        let hook = Arc::new(CountingHook {
            veto: true,
            ..CountingHook::default()
        });
        let dyn_hook: Arc<dyn ConnHook> = hook.clone();
        server.manager().set_hook(Some(dyn_hook));
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        expect_closed(&mut client).await;
        wait_for_count(&server, 0).await;

        server.stop().await;
        assert_eq!(hook.connected.load(Ordering::SeqCst), 1);
        assert_eq!(hook.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_removes_connection() {
        let server = test_server(ManagerConfig {
            connection_timeout: 2,
            ..ManagerConfig::default()
        });
        let hook = Arc::new(CountingHook::default());
        let dyn_hook: Arc<dyn ConnHook> = hook.clone();
        server.manager().set_hook(Some(dyn_hook));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let accepted_at = Instant::now()
            .checked_sub(Duration::from_secs(10))
            .unwrap();
        supervise(Arc::clone(&server.inner), stream, peer, accepted_at).await;

        assert_eq!(server.manager().conn_count(), 0);
        assert_eq!(hook.connected.load(Ordering::SeqCst), 0);
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_stop_drains_queued_frames() {
        let server = test_server(ManagerConfig::default());
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;
        let conn = server.manager().all_conns().pop().unwrap();
        for id in 1..=3 {
            conn.try_send_message(Message::new(format!("q{id}"), id, 7))
                .unwrap();
        }

        server.stop().await;
        assert_eq!(server.manager().conn_count(), 0);

        let mut buf = BytesMut::new();
        for id in 1..=3 {
            let msg = recv(&mut client, &mut buf).await;
            assert_eq!(msg.message_id(), id);
            assert_eq!(msg.body().as_ref(), format!("q{id}").as_bytes());
        }
        expect_closed(&mut client).await;
    }

    #[tokio::test]
    async fn test_stop_bounded_when_peer_stops_reading() {
        let server = test_server(ManagerConfig {
            write_timeout: 0,
            ..ManagerConfig::default()
        });
        let addr = server.start().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;
        let conn = server.manager().all_conns().pop().unwrap();
        let body = Bytes::from(vec![0u8; 4 << 20]);
        for id in 0..20 {
            conn.try_send_message(Message::new(body.clone(), id, 1))
                .unwrap();
        }
        // Let the writer fill the socket buffers and block.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), server.stop()).await;
        assert!(stopped.is_ok(), "stop() did not return");
        assert_eq!(server.manager().conn_count(), 0);
    }

    #[tokio::test]
    async fn test_reader_returns_message_to_pool() {
        let server = test_server(ManagerConfig::default());
        let addr = server.start().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_count(&server, 1).await;
        drop(client);
        wait_for_count(&server, 0).await;

        server.stop().await;
        assert_eq!(server.inner.pool.idle(TCP_KIND), Ok(1));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = test_server(ManagerConfig::default());
        let addr = server.start().unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.start().is_err());
        server.stop().await;
    }
}
