//! The accept-and-dispatch layer.
//!
//! The server lives on its base loop: accepting, naming and the
//! connection table all happen there. Each new connection is dealt to the
//! next pool loop round-robin and spends its whole life on that loop;
//! teardown hops back to the base loop to erase the table entry, then
//! back to the connection's loop for the final unregister.

use crate::acceptor::Acceptor;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::ThreadInitCallback;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::sockets;
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A multi-loop TCP server.
pub struct TcpServer {
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Arc<EventLoopThreadPool>,
    connection_cb: RefCell<ConnectionCallback>,
    message_cb: RefCell<MessageCallback>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    thread_init_cb: RefCell<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: Cell<u64>,
    connections: RefCell<HashMap<String, TcpConnectionPtr>>,
    // declared last: the acceptor's teardown still needs the loop alive
    base_loop: Arc<EventLoop>,
}

// The cells and the connection table are only touched on the base loop's
// thread; the Arc crosses threads so connection close paths running on
// I/O loops can marshal removals back here.
unsafe impl Send for TcpServer {}
unsafe impl Sync for TcpServer {}

impl TcpServer {
    /// Creates a server bound to `listen_addr`, not yet listening.
    ///
    /// # Errors
    /// if the listening socket cannot be created, configured or bound
    pub fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(base_loop, listen_addr, reuse_port)?;
        let default_conn_cb: ConnectionCallback =
            Arc::new(crate::tcp_connection::default_connection_callback);
        let default_msg_cb: MessageCallback =
            Arc::new(crate::tcp_connection::default_message_callback);
        let server = Arc::new(TcpServer {
            base_loop: Arc::clone(base_loop),
            ip_port: listen_addr.to_string(),
            name: name.clone(),
            acceptor: Arc::clone(&acceptor),
            thread_pool: Arc::new(EventLoopThreadPool::new(Arc::clone(base_loop), name)),
            connection_cb: RefCell::new(default_conn_cb),
            message_cb: RefCell::new(default_msg_cb),
            write_complete_cb: RefCell::new(None),
            thread_init_cb: RefCell::new(None),
            started: AtomicBool::new(false),
            next_conn_id: Cell::new(1),
            connections: RefCell::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&server);
        acceptor.set_new_connection_callback(move |sockfd, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(sockfd, peer_addr);
            }
        });
        Ok(server)
    }

    /// The server's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The listen address as given, e.g. `127.0.0.1:2007`.
    #[must_use]
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The base loop the server runs on.
    #[must_use]
    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.base_loop
    }

    /// The actually bound address, with the real port when the listen
    /// address asked for port 0.
    ///
    /// # Errors
    /// any `getsockname(2)` error
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// The pool dealing out I/O loops.
    #[must_use]
    pub fn thread_pool(&self) -> &Arc<EventLoopThreadPool> {
        &self.thread_pool
    }

    /// Sets how many I/O loop threads to spawn on start. Zero (the
    /// default) keeps all connections on the base loop.
    pub fn set_thread_num(&self, num: usize) {
        self.thread_pool.set_thread_num(num);
    }

    /// Replaces the connection callback handed to new connections.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = cb;
    }

    /// Replaces the message callback handed to new connections.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = cb;
    }

    /// Installs the write-complete callback handed to new connections.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    /// Installs the per-thread init callback passed to the pool.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_cb.borrow_mut() = Some(cb);
    }

    /// Starts the pool and the listener. Idempotent; only the first call
    /// does anything.
    ///
    /// # Errors
    /// if the pool's threads cannot be spawned
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.thread_pool.start(self.thread_init_cb.borrow().clone())?;
            assert!(!self.acceptor.listening());
            let acceptor = Arc::clone(&self.acceptor);
            self.base_loop.run_in_loop(move || acceptor.listen());
        }
        Ok(())
    }

    fn new_connection(self: &Arc<Self>, sockfd: OwnedFd, peer_addr: SocketAddr) {
        self.base_loop.assert_in_loop_thread();
        let io_loop = self.thread_pool.get_next_loop();
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-{}#{conn_id}", self.name, self.ip_port);
        crate::info!(
            "TcpServer::new_connection [{}] - new connection [{conn_name}] from {peer_addr}",
            self.name
        );
        let local_addr = match sockets::get_local_addr(sockfd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(e) => {
                crate::error!("TcpServer::new_connection getsockname: {e}");
                return;
            }
        };
        let conn = TcpConnection::new(
            Arc::clone(&io_loop),
            conn_name.clone(),
            sockfd,
            local_addr,
            peer_addr,
        );
        _ = self
            .connections
            .borrow_mut()
            .insert(conn_name, Arc::clone(&conn));
        conn.set_connection_callback(self.connection_cb.borrow().clone());
        conn.set_message_callback(self.message_cb.borrow().clone());
        if let Some(cb) = self.write_complete_cb.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));
        let established = Arc::clone(&conn);
        io_loop.run_in_loop(move || established.connect_established());
    }

    // runs on the connection's loop; hop to the base loop for the table
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.base_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &TcpConnectionPtr) {
        self.base_loop.assert_in_loop_thread();
        crate::info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.borrow_mut().remove(conn.name());
        assert!(removed.is_some());
        let io_loop = Arc::clone(conn.get_loop());
        let conn = Arc::clone(conn);
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.base_loop.assert_in_loop_thread();
        crate::trace!("TcpServer::drop [{}]", self.name);
        for (_, conn) in self.connections.borrow_mut().drain() {
            let io_loop = Arc::clone(conn.get_loop());
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("ip_port", &self.ip_port)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("connections", &self.connections.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn any_local_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn echoes_and_observes_half_close() {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&base_loop, &any_local_addr(), "echo-test", false).unwrap();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&transitions);
        server.set_connection_callback(Arc::new(move |conn| {
            seen.lock()
                .unwrap()
                .push(if conn.connected() { "up" } else { "down" });
        }));
        server.set_message_callback(Arc::new(|conn, buf, _when| {
            let msg = buf.retrieve_all_as_bytes();
            conn.send(&msg);
        }));
        server.start().unwrap();
        let listen_addr = server.local_addr().unwrap();

        let quitter = Arc::clone(&base_loop);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(listen_addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut echoed = [0_u8; 4];
            stream.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed, b"ping");
            // half-close; the server sees EOF, tears down and closes,
            // which we observe as EOF on our read side
            stream.shutdown(std::net::Shutdown::Write).unwrap();
            let mut rest = [0_u8; 1];
            assert_eq!(stream.read(&mut rest).unwrap(), 0);
            quitter.quit();
        });

        base_loop.run();
        client.join().unwrap();
        assert_eq!(*transitions.lock().unwrap(), ["up", "down"]);
        drop(server);
    }

    #[test]
    fn connections_are_dealt_round_robin_across_io_loops() {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&base_loop, &any_local_addr(), "rr-test", false).unwrap();
        server.set_thread_num(3);
        let loops_seen = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&loops_seen);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                seen.lock()
                    .unwrap()
                    .push(Arc::as_ptr(conn.get_loop()) as usize);
            }
        }));
        server.start().unwrap();
        let listen_addr = server.local_addr().unwrap();

        let progress = Arc::clone(&loops_seen);
        let quitter = Arc::clone(&base_loop);
        let client = thread::spawn(move || {
            let mut streams = Vec::new();
            for _ in 0..6 {
                streams.push(TcpStream::connect(listen_addr).unwrap());
            }
            while progress.lock().unwrap().len() < 6 {
                thread::sleep(Duration::from_millis(5));
            }
            drop(streams);
            quitter.quit();
        });

        base_loop.run();
        client.join().unwrap();
        let seen = loops_seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        let distinct: HashSet<usize> = seen.iter().copied().collect();
        assert_eq!(distinct.len(), 3);
        // six connections over three loops: exactly two each
        for event_loop in &distinct {
            assert_eq!(seen.iter().filter(|l| *l == event_loop).count(), 2);
        }
        drop(seen);
        drop(server);
    }

    #[test]
    fn high_water_mark_fires_once_per_crossing_and_shutdown_drains() {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&base_loop, &any_local_addr(), "hwm-test", false).unwrap();
        const CHUNK: usize = 8 * 1024 * 1024;
        let crossings = Arc::new(AtomicUsize::new(0));
        let write_completes = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&crossings);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let hits = Arc::clone(&hits);
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, _queued| {
                        _ = hits.fetch_add(1, Ordering::AcqRel);
                    }),
                    64 * 1024,
                );
                let chunk = vec![0xAB_u8; CHUNK];
                // the first send crosses the mark; the second stays above
                // it and must not refire
                conn.send(&chunk);
                conn.send(&chunk);
                conn.shutdown();
            }
        }));
        let completes = Arc::clone(&write_completes);
        server.set_write_complete_callback(Arc::new(move |_conn| {
            _ = completes.fetch_add(1, Ordering::AcqRel);
        }));
        server.start().unwrap();
        let listen_addr = server.local_addr().unwrap();

        let quitter = Arc::clone(&base_loop);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(listen_addr).unwrap();
            let mut total = 0_usize;
            let mut buf = vec![0_u8; 64 * 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) => panic!("client read: {e}"),
                }
            }
            // shutdown() waited for the buffered output to drain
            assert_eq!(total, 2 * CHUNK);
            quitter.quit();
        });

        base_loop.run();
        client.join().unwrap();
        assert_eq!(crossings.load(Ordering::Acquire), 1);
        assert!(write_completes.load(Ordering::Acquire) >= 1);
        drop(server);
    }

    #[test]
    fn force_close_is_immediate_and_idempotent() {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&base_loop, &any_local_addr(), "fc-test", false).unwrap();
        let downs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&downs);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                // the delayed close fires long after the connection is
                // gone and must degrade to a no-op
                conn.force_close_with_delay(Duration::from_millis(30));
                conn.force_close();
                conn.force_close();
            } else {
                _ = counter.fetch_add(1, Ordering::AcqRel);
            }
        }));
        server.start().unwrap();
        let listen_addr = server.local_addr().unwrap();

        let quitter = Arc::clone(&base_loop);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(listen_addr).unwrap();
            let mut buf = [0_u8; 1];
            assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);
            // outlive the delayed close so a buggy second teardown would
            // still land inside the running loop
            thread::sleep(Duration::from_millis(80));
            quitter.quit();
        });

        base_loop.run();
        client.join().unwrap();
        assert_eq!(downs.load(Ordering::Acquire), 1);
        drop(server);
    }

    #[test]
    fn shutdown_deadline_force_closes_a_lingering_peer() {
        let base_loop = EventLoop::new().unwrap();
        let server =
            TcpServer::new(&base_loop, &any_local_addr(), "deadline-test", false).unwrap();
        let downs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&downs);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                conn.send(b"bye");
                conn.shutdown_and_force_close_after(Duration::from_millis(40));
            } else {
                _ = counter.fetch_add(1, Ordering::AcqRel);
            }
        }));
        server.start().unwrap();
        let listen_addr = server.local_addr().unwrap();

        let observed = Arc::clone(&downs);
        let quitter = Arc::clone(&base_loop);
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(listen_addr).unwrap();
            let mut bye = [0_u8; 3];
            stream.read_exact(&mut bye).unwrap();
            assert_eq!(&bye, b"bye");
            // the server half-closed; never close our side and let the
            // deadline tear the connection down anyway
            let mut rest = [0_u8; 1];
            assert_eq!(stream.read(&mut rest).unwrap(), 0);
            while observed.load(Ordering::Acquire) == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            quitter.quit();
        });

        base_loop.run();
        client.join().unwrap();
        assert_eq!(downs.load(Ordering::Acquire), 1);
        drop(server);
    }

    #[test]
    fn scan_poller_echoes_across_channel_removal() {
        std::env::set_var("MUXIO_USE_POLL", "1");
        let base_loop = EventLoop::new().unwrap();
        std::env::remove_var("MUXIO_USE_POLL");
        let server = TcpServer::new(&base_loop, &any_local_addr(), "scan-test", false).unwrap();
        server.set_message_callback(Arc::new(|conn, buf, _when| {
            let msg = buf.retrieve_all_as_bytes();
            conn.send(&msg);
        }));
        server.start().unwrap();
        let listen_addr = server.local_addr().unwrap();

        let quitter = Arc::clone(&base_loop);
        let client = thread::spawn(move || {
            let mut first = TcpStream::connect(listen_addr).unwrap();
            let mut second = TcpStream::connect(listen_addr).unwrap();
            let mut echoed = [0_u8; 4];
            first.write_all(b"one.").unwrap();
            first.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed, b"one.");
            second.write_all(b"two.").unwrap();
            second.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed, b"two.");
            // closing the first connection swap-removes its slot in the
            // pollfd array; the second, registered behind it, moves and
            // must keep dispatching
            drop(first);
            thread::sleep(Duration::from_millis(50));
            second.write_all(b"more").unwrap();
            second.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed, b"more");
            quitter.quit();
        });

        base_loop.run();
        client.join().unwrap();
        drop(server);
    }

    #[test]
    fn start_is_idempotent() {
        let base_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&base_loop, &any_local_addr(), "twice-test", false).unwrap();
        server.start().unwrap();
        server.start().unwrap();
        drop(server);
    }
}
