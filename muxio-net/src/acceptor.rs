//! Listening-socket wrapper that feeds accepted connections to a
//! callback.
//!
//! Keeps an idle descriptor on `/dev/null` in reserve. When `accept4(2)`
//! fails with `EMFILE` the reserve is closed, the pending connection is
//! accepted and immediately closed so the peer sees an orderly shutdown
//! instead of a hanging socket, and the reserve is reopened.

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sockets::{self, Socket};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;

/// Receives each accepted descriptor and the peer address.
pub type NewConnectionCallback = Box<dyn FnMut(OwnedFd, SocketAddr)>;

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr().cast(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Accepts connections on one listening socket, loop-affine.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Rc<Channel>,
    listening: Cell<bool>,
    idle_fd: RefCell<Option<OwnedFd>>,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
}

// Loop-affine like the channel it owns; the Arc only crosses threads so
// the owning server can be shared, every method asserts affinity.
unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    /// Creates a bound, not yet listening acceptor.
    ///
    /// # Errors
    /// if the socket cannot be created, configured or bound
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let family = if listen_addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let accept_socket = Socket::new(sockets::create_nonblocking(family)?);
        accept_socket.set_reuse_addr(true)?;
        accept_socket.set_reuse_port(reuse_port)?;
        accept_socket.bind_address(listen_addr)?;
        let idle_fd = open_idle_fd()?;
        let accept_channel = Channel::new(event_loop, accept_socket.fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: Arc::clone(event_loop),
            accept_socket,
            accept_channel: Rc::clone(&accept_channel),
            listening: Cell::new(false),
            idle_fd: RefCell::new(Some(idle_fd)),
            new_connection_cb: RefCell::new(None),
        });
        let weak = Arc::downgrade(&acceptor);
        accept_channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    /// Installs the callback that takes ownership of each accepted
    /// descriptor. Without one, accepted connections are closed.
    pub fn set_new_connection_callback(&self, cb: impl FnMut(OwnedFd, SocketAddr) + 'static) {
        *self.new_connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// `true` once [`Acceptor::listen`] ran.
    #[must_use]
    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// The bound address, with the real port when binding asked for 0.
    ///
    /// # Errors
    /// any `getsockname(2)` error
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockets::get_local_addr(self.accept_socket.fd())
    }

    /// Starts listening and watching for readability.
    ///
    /// # Panics
    /// on a foreign thread, or if `listen(2)` fails
    pub fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.set(true);
        if let Err(e) = self.accept_socket.listen() {
            panic!("Acceptor::listen(): {e}");
        }
        self.accept_channel.enable_reading();
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        // drain the backlog; one readiness event may cover many connects
        loop {
            match self.accept_socket.accept() {
                Ok((fd, peer_addr)) => {
                    if let Some(cb) = self.new_connection_cb.borrow_mut().as_mut() {
                        cb(fd, peer_addr);
                    } else {
                        crate::warn!("no connection callback, closing connection from {peer_addr}");
                    }
                }
                Err(e) => {
                    match e.kind() {
                        io::ErrorKind::WouldBlock => {}
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            crate::error!("in Acceptor::handle_read(): {e}");
                            if e.raw_os_error() == Some(libc::EMFILE) {
                                self.drain_with_idle_fd();
                                continue;
                            }
                        }
                    }
                    break;
                }
            }
        }
    }

    fn drain_with_idle_fd(&self) {
        let mut slot = self.idle_fd.borrow_mut();
        drop(slot.take());
        let drained = unsafe {
            libc::accept(
                self.accept_socket.fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if drained >= 0 {
            _ = unsafe { libc::close(drained) };
        }
        *slot = open_idle_fd().ok();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.accept_socket.fd())
            .field("listening", &self.listening.get())
            .finish_non_exhaustive()
    }
}
