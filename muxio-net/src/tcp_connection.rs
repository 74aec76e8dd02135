//! One established TCP connection, owned by exactly one loop.
//!
//! The connection walks a four-state machine:
//!
//! ```text
//! Connecting -> Connected -> Disconnecting -> Disconnected
//!                    \________________________/
//! ```
//!
//! `Connecting` lasts from accept until `connect_established` runs on the
//! owning loop; `Disconnecting` covers a half-close still draining its
//! output buffer. All I/O and buffer access happens on the owning loop;
//! `send`, `shutdown` and `force_close` marshal themselves there, so they
//! are callable from anywhere.

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sockets::{self, Socket};
use muxio_timer::Timestamp;
use std::any::Any;
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How user code holds a connection.
pub type TcpConnectionPtr = Arc<TcpConnection>;
/// Fired on establishment and on teardown.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired whenever bytes arrived in the input buffer.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;
/// Fired when the output buffer fully drained into the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Fired when the output buffer crossed the high-water mark, with the
/// queued byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Box<dyn Fn(&TcpConnectionPtr) + Send>;

/// Default connection callback: log the transition.
pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    crate::trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Default message callback: discard everything.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Timestamp) {
    buf.retrieve_all();
}

const DEFAULT_HIGH_WATER_MARK: usize = 8 * 1024 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

/// A non-blocking TCP connection plus its input and output buffers.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: Cell<bool>,
    socket: Socket,
    channel: Rc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    connection_cb: RefCell<ConnectionCallback>,
    message_cb: RefCell<MessageCallback>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_cb: RefCell<Option<HighWaterMarkCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
    high_water_mark: Cell<usize>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
    context: RefCell<Option<Box<dyn Any + Send + Sync>>>,
}

// Buffers, callbacks and the channel are only touched on the owning
// loop's thread; the affinity asserts uphold that. The Arc crosses
// threads so user code can call send/shutdown/force_close from anywhere,
// and those marshal onto the loop.
unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

impl TcpConnection {
    /// Wraps an accepted descriptor. The connection starts `Connecting`;
    /// its owner must arrange for [`TcpConnection::connect_established`]
    /// to run on `event_loop`.
    #[must_use]
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        sockfd: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let fd = sockfd.as_raw_fd();
        let conn = Arc::new_cyclic(|weak: &std::sync::Weak<TcpConnection>| {
            let channel = Channel::new(&event_loop, fd);
            {
                let weak = weak.clone();
                channel.set_read_callback(move |when| {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_read(when);
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_write_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_write();
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_close_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_close();
                    }
                });
            }
            {
                let weak = weak.clone();
                channel.set_error_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_error();
                    }
                });
            }
            TcpConnection {
                event_loop,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                reading: Cell::new(true),
                socket: Socket::new(sockfd),
                channel,
                local_addr,
                peer_addr,
                connection_cb: RefCell::new(Arc::new(default_connection_callback)),
                message_cb: RefCell::new(Arc::new(default_message_callback)),
                write_complete_cb: RefCell::new(None),
                high_water_mark_cb: RefCell::new(None),
                close_cb: RefCell::new(None),
                high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
                input: RefCell::new(Buffer::new()),
                output: RefCell::new(Buffer::new()),
                context: RefCell::new(None),
            }
        });
        crate::debug!("TcpConnection::new [{}] fd = {fd}", conn.name);
        _ = conn.socket.set_keep_alive(true);
        conn
    }

    /// The connection's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Our end of the connection.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The peer's end of the connection.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The loop this connection lives on.
    #[must_use]
    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// `true` while fully established.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// `true` once teardown finished.
    #[must_use]
    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// `true` while the channel watches for readability.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.reading.get()
    }

    /// Toggles `TCP_NODELAY`.
    ///
    /// # Errors
    /// any `setsockopt(2)` error
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Stores an arbitrary per-connection value, e.g. codec state.
    pub fn set_context(&self, context: Box<dyn Any + Send + Sync>) {
        *self.context.borrow_mut() = Some(context);
    }

    /// Borrows the per-connection value.
    #[must_use]
    pub fn context(&self) -> Ref<'_, Option<Box<dyn Any + Send + Sync>>> {
        self.context.borrow()
    }

    /// Takes the per-connection value back out.
    #[must_use]
    pub fn take_context(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.context.borrow_mut().take()
    }

    /// Replaces the connection callback.
    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = cb;
    }

    /// Replaces the message callback.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = cb;
    }

    /// Installs the write-complete callback.
    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    /// Installs the high-water-mark callback.
    ///
    /// It fires once per upward crossing of `mark` queued output bytes,
    /// not on every send made while above it. Backpressure is the
    /// caller's business: the usual reaction is `stop_read` on the
    /// source connection until the write-complete callback runs.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_mark_cb.borrow_mut() = Some(cb);
        self.high_water_mark.set(mark);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    /// Sends `data`, writing directly when possible and buffering the
    /// rest. Callable from any thread; off-loop calls copy the data.
    /// Silently drops the data once disconnect has begun.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() == State::Connected {
            if self.event_loop.is_in_loop_thread() {
                self.send_in_loop(data);
            } else {
                let conn = Arc::clone(self);
                let owned = data.to_vec();
                self.event_loop.run_in_loop(move || conn.send_in_loop(&owned));
            }
        }
    }

    /// Sends and consumes the readable region of `buf`.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() == State::Connected {
            if self.event_loop.is_in_loop_thread() {
                self.send_in_loop(buf.peek());
                buf.retrieve_all();
            } else {
                let conn = Arc::clone(self);
                let owned = buf.retrieve_all_as_bytes();
                self.event_loop.run_in_loop(move || conn.send_in_loop(&owned));
            }
        }
    }

    /// Half-closes the write side once buffered output has drained.
    /// Reading continues until the peer closes.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Like [`TcpConnection::shutdown`], but additionally force-closes
    /// after `delay` in case the peer never closes its side.
    pub fn shutdown_and_force_close_after(self: &Arc<Self>, delay: Duration) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.event_loop
                .run_in_loop(move || conn.shutdown_and_force_close_in_loop(delay));
        }
    }

    /// Closes both directions as soon as the owning loop gets to it,
    /// without waiting for buffered output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.event_loop.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// Force-closes after `delay`, holding only a weak reference so an
    /// earlier teardown wins.
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = Arc::downgrade(self);
            _ = self.event_loop.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resumes watching for readability. Loop-affine state; call from the
    /// owning loop or via `run_in_loop`.
    pub fn start_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if !conn.reading.get() || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.set(true);
            }
        });
    }

    /// Stops watching for readability, leaving data in the kernel to
    /// backpressure the peer.
    pub fn stop_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.event_loop.run_in_loop(move || {
            if conn.reading.get() || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.set(false);
            }
        });
    }

    /// Finishes establishment on the owning loop: ties the channel,
    /// starts reading and fires the connection callback.
    ///
    /// # Panics
    /// off the owning thread, or when not `Connecting`
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let owner: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
        self.channel.tie(&owner);
        self.channel.enable_reading();
        let cb = self.connection_cb.borrow().clone();
        cb(self);
    }

    /// Final teardown on the owning loop; the last thing ever called.
    /// Fires the connection callback when the close path did not already
    /// run, then unregisters the channel.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        // Disconnecting here means a shutdown was still draining when the
        // owner tore the connection down
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            let cb = self.connection_cb.borrow().clone();
            cb(self);
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        let result = self.input.borrow_mut().read_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let cb = self.message_cb.borrow().clone();
                let mut input = self.input.borrow_mut();
                cb(self, &mut input, receive_time);
            }
            Err(e) => {
                if !matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) {
                    crate::error!("TcpConnection::handle_read() [{}]: {e}", self.name);
                    self.handle_error();
                }
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            crate::trace!("connection fd = {} is down, no more writing", self.channel.fd());
            return;
        }
        let result = {
            let output = self.output.borrow();
            sockets::write(self.channel.fd(), output.peek())
        };
        match result {
            Ok(n) => {
                let drained = {
                    let mut output = self.output.borrow_mut();
                    output.retrieve(n);
                    output.readable_bytes() == 0
                };
                if drained {
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_cb.borrow().clone() {
                        let conn = Arc::clone(self);
                        self.event_loop.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    crate::error!("TcpConnection::handle_write() [{}]: {e}", self.name);
                }
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        crate::trace!(
            "TcpConnection::handle_close() fd = {} state = {:?}",
            self.channel.fd(),
            self.state()
        );
        assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));
        // no close(2) here: the socket closes when the connection drops
        self.set_state(State::Disconnected);
        self.channel.disable_all();
        let guard = Arc::clone(self);
        let cb = self.connection_cb.borrow().clone();
        cb(&guard);
        if let Some(close_cb) = self.close_cb.borrow().as_ref() {
            close_cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = sockets::get_socket_error(self.channel.fd());
        crate::error!(
            "TcpConnection::handle_error() [{}] - SO_ERROR = {err} {}",
            self.name,
            io::Error::from_raw_os_error(err)
        );
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            crate::warn!("disconnected, give up writing");
            return;
        }
        let mut nwrote = 0_usize;
        let mut remaining = data.len();
        let mut fault_error = false;
        // nothing queued yet: try the direct write fast path
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(cb) = self.write_complete_cb.borrow().clone() {
                            let conn = Arc::clone(self);
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        crate::error!("TcpConnection::send_in_loop() [{}]: {e}", self.name);
                        if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                            fault_error = true;
                        }
                    }
                }
            }
        }
        if !fault_error && remaining > 0 {
            let old_len = self.output.borrow().readable_bytes();
            let mark = self.high_water_mark.get();
            // fires only on the crossing, not on every send above it
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.high_water_mark_cb.borrow().clone() {
                    let conn = Arc::clone(self);
                    let queued = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, queued));
                }
            }
            self.output.borrow_mut().append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                crate::error!("TcpConnection::shutdown_in_loop() [{}]: {e}", self.name);
            }
        }
    }

    fn shutdown_and_force_close_in_loop(self: &Arc<Self>, delay: Duration) {
        self.shutdown_in_loop();
        let weak = Arc::downgrade(self);
        _ = self.event_loop.run_after(delay, move || {
            if let Some(conn) = weak.upgrade() {
                conn.force_close_in_loop();
            }
        });
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        crate::debug!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
        assert_eq!(self.state(), State::Disconnected);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
