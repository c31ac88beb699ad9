// src/reactor.rs
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::error::{ServerError, ServerResult};
use crate::pool::WorkerPool;
use crate::slab::{ConnHandle, ConnectionTable};
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, Epoll, EventFd,
    epoll_event,
};
use crate::timer::TimerHeap;

const MAX_EVENTS: usize = 1024;
const WAKER_TOKEN: u64 = u64::MAX;
const BUSY_MESSAGE: &[u8] = b"Server busy!";

/// `(fd, generation)` pairs handed back to the reactor thread.
type FdQueue = Arc<Mutex<Vec<(RawFd, u64)>>>;

/// Stops a running [`Reactor`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<EventFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.notify() {
            warn!(error = %e, "failed to wake reactor");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single-threaded event loop owning the listener, the connection table and
/// the idle timers. Socket I/O and request handling run on the worker pool;
/// one-shot registration keeps each connection on at most one worker.
pub struct Reactor {
    config: Arc<ServerConfig>,
    epoll: Arc<Epoll>,
    listen_fd: RawFd,
    local_addr: SocketAddr,
    conn_events: u32,
    waker: Arc<EventFd>,
    shutdown: Arc<AtomicBool>,
    table: ConnectionTable,
    timers: TimerHeap,
    /// Timers that fired while their connection was busy in a worker.
    deferred: FdQueue,
    /// Connections closed by a worker or a timer, still holding a slot.
    closed: FdQueue,
    users: Arc<AtomicUsize>,
    pool: WorkerPool,
}

impl Reactor {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let addr = config.addr();
        let listen_fd = syscalls::create_listen_socket(addr, config.linger)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let guard = ListenGuard(listen_fd);

        let local_addr = syscalls::local_addr(listen_fd)?;
        let listen_events = EPOLLRDHUP | config.trigger_mode.listen_flags();
        let conn_events = EPOLLONESHOT | EPOLLRDHUP | config.trigger_mode.conn_flags();

        let epoll = Arc::new(Epoll::new()?);
        epoll.add(listen_fd, listen_fd as u64, EPOLLIN | listen_events)?;
        let waker = Arc::new(EventFd::new()?);
        epoll.add(waker.fd(), WAKER_TOKEN, EPOLLIN)?;

        let pool = WorkerPool::new(config.threads)?;

        info!(
            addr = %local_addr,
            listen_edge = config.trigger_mode.listen_edge,
            conn_edge = config.trigger_mode.conn_edge,
            timeout_ms = config.timeout_ms,
            linger = config.linger,
            threads = config.threads,
            doc_root = %config.doc_root.display(),
            "server init"
        );

        std::mem::forget(guard);
        Ok(Self {
            table: ConnectionTable::new(1024),
            timers: TimerHeap::with_capacity(64),
            deferred: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(Vec::new())),
            users: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
            epoll,
            listen_fd,
            local_addr,
            conn_events,
            waker,
            pool,
        })
    }

    /// Address actually bound, with port 0 resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Shared count of open client connections.
    pub fn users(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.users)
    }

    /// Run until a [`ShutdownHandle`] fires, then close every connection and
    /// drain the worker pool.
    pub fn run(&mut self) -> ServerResult<()> {
        info!(addr = %self.local_addr, "server start");
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let result = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(e) = self.turn(&mut events, None) {
                break Err(e);
            }
        };

        self.teardown();
        result
    }

    /// One pass of the loop: expire timers, reap closed connections, wait for
    /// readiness (never longer than `max_wait_ms` if given) and dispatch.
    fn turn(&mut self, events: &mut [epoll_event], max_wait_ms: Option<i32>) -> ServerResult<()> {
        let timeout_ms = match (self.next_timeout_ms(), max_wait_ms) {
            (-1, Some(cap)) => cap,
            (ms, Some(cap)) => ms.min(cap),
            (ms, None) => ms,
        };
        let n = self.epoll.wait(events, timeout_ms)?;

        for ev in &events[..n] {
            let (token, flags) = (ev.u64, ev.events);
            if token == WAKER_TOKEN {
                self.waker.drain();
                continue;
            }

            let fd = token as RawFd;
            if fd == self.listen_fd {
                self.deal_listen();
            } else if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                self.close_client(fd);
            } else if flags & EPOLLIN != 0 {
                self.deal_read(fd);
            } else if flags & EPOLLOUT != 0 {
                self.deal_write(fd);
            } else {
                warn!(fd, flags, "unexpected event");
            }
        }
        Ok(())
    }

    fn next_timeout_ms(&mut self) -> i32 {
        if self.config.timeout().is_some() {
            self.timers.tick();
            self.reschedule_deferred();
        }
        self.reap_closed();
        match self.timers.next_tick() {
            Some(wait) => {
                let ms = wait.as_millis() + u128::from(wait.subsec_nanos() % 1_000_000 != 0);
                i32::try_from(ms).unwrap_or(i32::MAX)
            }
            None => -1,
        }
    }

    fn task_ctx(&self) -> TaskCtx {
        TaskCtx {
            epoll: Arc::clone(&self.epoll),
            waker: Arc::clone(&self.waker),
            closed: Arc::clone(&self.closed),
            events: self.conn_events,
        }
    }

    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => {
                    if self.users.load(Ordering::Acquire) >= self.config.max_connections {
                        warn!(%addr, "clients are full");
                        send_busy(fd);
                    } else {
                        self.add_client(fd, addr);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
            if !self.config.trigger_mode.listen_edge {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let conn = Arc::new(Mutex::new(Connection::new(
            fd,
            addr,
            Arc::clone(&self.config),
            Arc::clone(&self.users),
        )));
        let generation = self.table.insert(fd, Arc::clone(&conn));

        if let Some(timeout) = self.config.timeout() {
            self.add_timer(fd, generation, Arc::downgrade(&conn), timeout);
        }

        if let Err(e) = self.epoll.add(fd, fd as u64, EPOLLIN | self.conn_events) {
            warn!(fd, error = %e, "failed to register client");
            self.close_client(fd);
            return;
        }
        info!(fd, %addr, "client in");
    }

    fn add_timer(&mut self, fd: RawFd, generation: u64, conn: Weak<Mutex<Connection>>, timeout: Duration) {
        let ctx = self.task_ctx();
        let deferred = Arc::clone(&self.deferred);
        self.timers.add(
            fd as u64,
            timeout,
            Box::new(move || {
                let Some(conn) = conn.upgrade() else { return };
                let mut guard = match conn.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(p)) => p.into_inner(),
                    Err(TryLockError::WouldBlock) => {
                        // busy in a worker: not idle
                        lock(&deferred).push((fd, generation));
                        return;
                    }
                };
                if !guard.is_closed() {
                    debug!(fd, "idle timeout");
                    ctx.close(&mut guard, generation);
                }
            }),
        );
    }

    fn reschedule_deferred(&mut self) {
        let pending = std::mem::take(&mut *lock(&self.deferred));
        let Some(timeout) = self.config.timeout() else {
            return;
        };
        for (fd, generation) in pending {
            if let Some(conn) = self.table.get_if(fd, generation) {
                self.add_timer(fd, generation, Arc::downgrade(&conn), timeout);
            }
        }
    }

    /// Drop the slot and timer of every connection closed off the reactor
    /// path. A slot already taken by a newer connection on the same fd is
    /// left alone.
    fn reap_closed(&mut self) {
        let closed = std::mem::take(&mut *lock(&self.closed));
        for (fd, generation) in closed {
            if self.table.remove(fd, generation).is_some() {
                self.timers.cancel(fd as u64);
            }
        }
    }

    fn extend_time(&mut self, fd: RawFd) {
        if let Some(timeout) = self.config.timeout() {
            self.timers.adjust(fd as u64, timeout);
        }
    }

    fn close_client(&mut self, fd: RawFd) {
        let Some((generation, conn)) = self.table.get(fd) else {
            return;
        };
        self.timers.cancel(fd as u64);
        close_conn(&self.epoll, &mut lock(&conn));
        self.table.remove(fd, generation);
    }

    fn deal_read(&mut self, fd: RawFd) {
        let Some((generation, conn)) = self.table.get(fd) else {
            return;
        };
        self.extend_time(fd);
        let ctx = self.task_ctx();
        self.pool.submit(move || on_read(&ctx, &conn, generation));
    }

    fn deal_write(&mut self, fd: RawFd) {
        let Some((generation, conn)) = self.table.get(fd) else {
            return;
        };
        self.extend_time(fd);
        let ctx = self.task_ctx();
        self.pool.submit(move || on_write(&ctx, &conn, generation));
    }

    fn teardown(&mut self) {
        self.pool.shutdown();
        self.timers.clear();
        lock(&self.deferred).clear();
        lock(&self.closed).clear();

        let conns = self.table.drain();
        let open = conns.len();
        for conn in conns {
            close_conn(&self.epoll, &mut lock(&conn));
        }
        info!(closed = open, "server stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        syscalls::close_fd(self.listen_fd);
    }
}

/// Closes the listener if construction fails half way.
struct ListenGuard(RawFd);

impl Drop for ListenGuard {
    fn drop(&mut self) {
        syscalls::close_fd(self.0);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send_busy(fd: RawFd) {
    if let Err(e) = syscalls::send_nosignal(fd, BUSY_MESSAGE) {
        debug!(fd, error = %e, "busy notice not delivered");
    }
    syscalls::close_fd(fd);
}

fn close_conn(epoll: &Epoll, conn: &mut Connection) {
    if conn.is_closed() {
        return;
    }
    if let Err(e) = epoll.delete(conn.fd()) {
        debug!(fd = conn.fd(), error = %e, "epoll delete failed");
    }
    info!(fd = conn.fd(), addr = %conn.addr(), "client quit");
    conn.close();
}

/// Handles a worker task or timer needs to re-arm or close a connection
/// outside the reactor's borrow.
#[derive(Clone)]
struct TaskCtx {
    epoll: Arc<Epoll>,
    waker: Arc<EventFd>,
    closed: FdQueue,
    events: u32,
}

impl TaskCtx {
    /// Close `conn` and queue its slot for the reactor to reap.
    fn close(&self, conn: &mut Connection, generation: u64) {
        if conn.is_closed() {
            return;
        }
        let fd = conn.fd();
        close_conn(&self.epoll, conn);
        lock(&self.closed).push((fd, generation));
        if let Err(e) = self.waker.notify() {
            warn!(error = %e, "failed to wake reactor");
        }
    }

    fn rearm(&self, conn: &mut Connection, generation: u64, interest: u32) {
        let fd = conn.fd();
        if let Err(e) = self.epoll.modify(fd, fd as u64, interest | self.events) {
            warn!(fd, error = %e, "failed to re-arm client");
            self.close(conn, generation);
        }
    }
}

fn on_process(ctx: &TaskCtx, conn: &mut Connection, generation: u64) {
    let interest = if conn.process() { EPOLLOUT } else { EPOLLIN };
    ctx.rearm(conn, generation, interest);
}

fn on_read(ctx: &TaskCtx, conn: &ConnHandle, generation: u64) {
    let mut conn = lock(conn);
    if conn.is_closed() {
        return;
    }
    match conn.read() {
        Ok(0) => {
            ctx.close(&mut conn, generation);
            return;
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            debug!(fd = conn.fd(), error = %e, "read failed");
            ctx.close(&mut conn, generation);
            return;
        }
    }
    on_process(ctx, &mut conn, generation);
}

fn on_write(ctx: &TaskCtx, conn: &ConnHandle, generation: u64) {
    let mut conn = lock(conn);
    if conn.is_closed() {
        return;
    }
    let result = conn.write();

    if conn.to_write_bytes() == 0 {
        if conn.is_keep_alive() {
            on_process(ctx, &mut conn, generation);
        } else {
            ctx.close(&mut conn, generation);
        }
        return;
    }

    match result {
        // level-triggered writes stop early with data left
        Ok(_) => ctx.rearm(&mut conn, generation, EPOLLOUT),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            ctx.rearm(&mut conn, generation, EPOLLOUT)
        }
        Err(e) => {
            debug!(fd = conn.fd(), error = %e, "write failed");
            ctx.close(&mut conn, generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, Permissions};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::fd::IntoRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    fn doc_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("index.html");
        fs::write(&page, "<h1>home</h1>").unwrap();
        fs::set_permissions(&page, Permissions::from_mode(0o644)).unwrap();
        dir
    }

    fn reactor(root: &tempfile::TempDir) -> Reactor {
        Reactor::new(ServerConfig {
            host: "127.0.0.1".parse().unwrap(),
            port: 0,
            threads: 2,
            doc_root: root.path().to_path_buf(),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    /// Turn the loop on this thread until `done` holds. Returns false after
    /// five seconds without it.
    fn drive(reactor: &mut Reactor, mut done: impl FnMut(&Reactor) -> bool) -> bool {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            reactor.turn(&mut events, Some(10)).unwrap();
            if done(reactor) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_worker_close_releases_slot_and_timer() {
        let root = doc_root();
        let mut reactor = reactor(&root);

        for _ in 0..3 {
            let mut stream = TcpStream::connect(reactor.local_addr()).unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                .unwrap();
            stream.set_nonblocking(true).unwrap();

            let mut res = Vec::new();
            let mut chunk = [0u8; 1024];
            let eof = drive(&mut reactor, |_| match stream.read(&mut chunk) {
                Ok(0) => true,
                Ok(n) => {
                    res.extend_from_slice(&chunk[..n]);
                    false
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(e) => panic!("read failed: {e}"),
            });
            assert!(eof, "server never closed the connection");
            assert!(res.starts_with(b"HTTP/1.1 200 OK\r\n"));
            assert!(res.ends_with(b"<h1>home</h1>"));

            assert!(drive(&mut reactor, |r| r.table.is_empty()));
            assert_eq!(reactor.timers.len(), 0);
            assert_eq!(reactor.users().load(Ordering::Acquire), 0);
        }
    }

    #[test]
    fn test_busy_connection_defers_eviction() {
        let root = doc_root();
        let mut reactor = reactor(&root);
        let timeout = reactor.config.timeout().unwrap();

        let (ours, _peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd = ours.into_raw_fd();
        reactor.add_client(fd, "127.0.0.1:4000".parse().unwrap());
        let (generation, conn) = reactor.table.get(fd).unwrap();

        // a worker holds the connection when its timer expires
        let held = conn.lock().unwrap();
        assert_eq!(reactor.timers.tick_at(Instant::now() + timeout * 2), 1);
        assert!(!reactor.timers.contains(fd as u64));
        reactor.reschedule_deferred();
        assert!(!held.is_closed());
        assert!(reactor.timers.contains(fd as u64));
        assert!(lock(&reactor.deferred).is_empty());
        drop(held);

        // idle now: the next expiry closes it and the reactor reaps the slot
        assert_eq!(reactor.timers.tick_at(Instant::now() + timeout * 2), 1);
        assert!(lock(&conn).is_closed());
        assert_eq!(reactor.table.len(), 1);
        reactor.reap_closed();
        assert!(reactor.table.get_if(fd, generation).is_none());
        assert!(reactor.table.is_empty());
        assert!(reactor.timers.is_empty());
        assert_eq!(reactor.users().load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_reap_skips_reused_slot() {
        let root = doc_root();
        let mut reactor = reactor(&root);

        let (ours, _peer) = UnixStream::pair().unwrap();
        let fd = ours.into_raw_fd();
        reactor.add_client(fd, "127.0.0.1:4000".parse().unwrap());
        let (generation, _) = reactor.table.get(fd).unwrap();

        // a stale close report for an older occupant of the same fd
        lock(&reactor.closed).push((fd, generation - 1));
        reactor.reap_closed();
        assert_eq!(reactor.table.len(), 1);
        assert!(reactor.timers.contains(fd as u64));

        reactor.close_client(fd);
        assert!(reactor.table.is_empty());
        assert!(reactor.timers.is_empty());
    }
}
