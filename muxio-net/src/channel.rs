//! A channel binds one file descriptor to the callbacks its readiness
//! events should fire.
//!
//! Channels never own their descriptor and are strictly loop-affine:
//! every method must run on the owning loop's thread. Interest bits use
//! the `poll(2)` constants; on Linux the `epoll` bits have the same
//! values, so both pollers consume them unchanged.

use crate::event_loop::EventLoop;
use muxio_timer::Timestamp;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;

/// Read callbacks get the poll return time.
pub type ReadEventCallback = Box<dyn FnMut(Timestamp)>;
/// Write, close and error callbacks take no arguments.
pub type EventCallback = Box<dyn FnMut()>;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::POLLOUT as u32;

/// Poller-private registration state of a channel that was never added.
pub(crate) const INDEX_NEW: i32 = -1;

/// One descriptor's registration with its event loop.
pub struct Channel {
    event_loop: std::sync::Weak<EventLoop>,
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    // poller bookkeeping: slot index for poll(2), membership state for epoll
    index: Cell<i32>,
    log_hup: Cell<bool>,
    tied: Cell<bool>,
    tie: RefCell<Option<std::sync::Weak<dyn Any + Send + Sync>>>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    read_cb: RefCell<Option<ReadEventCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    /// Creates a channel for `fd` owned by `event_loop`. The descriptor
    /// stays owned by the caller.
    #[must_use]
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new(Channel {
            event_loop: Arc::downgrade(event_loop),
            fd,
            events: Cell::new(NONE_EVENT),
            revents: Cell::new(NONE_EVENT),
            index: Cell::new(INDEX_NEW),
            log_hup: Cell::new(true),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    /// The watched descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current interest bits.
    #[must_use]
    pub fn events(&self) -> u32 {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    /// Suppresses the log line for a bare `POLLHUP`; connectors see one
    /// on every refused connect.
    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.set(on);
    }

    /// Installs the read callback.
    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        *self.read_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Installs the write callback.
    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        *self.write_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Installs the close callback.
    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Installs the error callback.
    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        *self.error_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties the channel to its owner object. While a dispatch is running
    /// the tie is upgraded and held, so the owner cannot be destroyed
    /// mid-callback; once the owner is gone, events are silently dropped.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(Arc::downgrade(owner));
        self.tied.set(true);
    }

    /// `true` when no events are of interest.
    #[must_use]
    pub fn is_none_event(&self) -> bool {
        self.events.get() == NONE_EVENT
    }

    /// `true` when `POLLOUT` is of interest.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.events.get() & WRITE_EVENT != 0
    }

    /// `true` when `POLLIN` is of interest.
    #[must_use]
    pub fn is_reading(&self) -> bool {
        self.events.get() & READ_EVENT != 0
    }

    /// Starts watching for readability.
    pub fn enable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() | READ_EVENT);
        self.update();
    }

    /// Stops watching for readability.
    pub fn disable_reading(self: &Rc<Self>) {
        self.events.set(self.events.get() & !READ_EVENT);
        self.update();
    }

    /// Starts watching for writability.
    pub fn enable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() | WRITE_EVENT);
        self.update();
    }

    /// Stops watching for writability.
    pub fn disable_writing(self: &Rc<Self>) {
        self.events.set(self.events.get() & !WRITE_EVENT);
        self.update();
    }

    /// Clears all interest, leaving the channel parked in the poller.
    pub fn disable_all(self: &Rc<Self>) {
        self.events.set(NONE_EVENT);
        self.update();
    }

    /// Unregisters from the poller. All interest must be disabled first.
    ///
    /// # Panics
    /// if any event is still of interest
    pub fn remove(self: &Rc<Self>) {
        assert!(self.is_none_event());
        self.added_to_loop.set(false);
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    /// The loop this channel belongs to, when it is still alive.
    #[must_use]
    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.event_loop.upgrade()
    }

    fn update(self: &Rc<Self>) {
        self.added_to_loop.set(true);
        let event_loop = self
            .event_loop
            .upgrade()
            .expect("channel outlived its event loop");
        event_loop.update_channel(self);
    }

    // teardown path for loop-internal channels: the owning Arc is already
    // being dropped, so update()'s upgrade would fail
    pub(crate) fn clear_interest(&self) {
        self.events.set(NONE_EVENT);
    }

    pub(crate) fn mark_detached(&self) {
        self.added_to_loop.set(false);
    }

    /// Dispatches the readiness bits set by the poller to the installed
    /// callbacks.
    pub fn handle_event(self: &Rc<Self>, receive_time: Timestamp) {
        if self.tied.get() {
            let guard = self
                .tie
                .borrow()
                .as_ref()
                .and_then(std::sync::Weak::upgrade);
            if let Some(_owner) = guard {
                self.handle_event_with_guard(receive_time);
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.event_handling.set(true);
        let revents = self.revents.get();
        crate::trace!("fd = {} {{{}}}", self.fd, events_to_string(self.fd, revents));
        if revents & libc::POLLHUP as u32 != 0 && revents & libc::POLLIN as u32 == 0 {
            if self.log_hup.get() {
                crate::warn!("fd = {} Channel::handle_event() POLLHUP", self.fd);
            }
            if let Some(cb) = self.close_cb.borrow_mut().as_mut() {
                cb();
            }
        }
        if revents & libc::POLLNVAL as u32 != 0 {
            crate::warn!("fd = {} Channel::handle_event() POLLNVAL", self.fd);
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) as u32 != 0 {
            if let Some(cb) = self.error_cb.borrow_mut().as_mut() {
                cb();
            }
        }
        if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as u32 != 0 {
            if let Some(cb) = self.read_cb.borrow_mut().as_mut() {
                cb(receive_time);
            }
        }
        if revents & libc::POLLOUT as u32 != 0 {
            if let Some(cb) = self.write_cb.borrow_mut().as_mut() {
                cb();
            }
        }
        self.event_handling.set(false);
    }

    /// Human-readable interest bits, for logging.
    #[must_use]
    pub fn events_to_string(&self) -> String {
        events_to_string(self.fd, self.events.get())
    }

    /// Human-readable readiness bits, for logging.
    #[must_use]
    pub fn revents_to_string(&self) -> String {
        events_to_string(self.fd, self.revents.get())
    }
}

fn events_to_string(fd: RawFd, events: u32) -> String {
    let mut out = format!("{fd}: ");
    for (bit, name) in [
        (libc::POLLIN as u32, "IN "),
        (libc::POLLPRI as u32, "PRI "),
        (libc::POLLOUT as u32, "OUT "),
        (libc::POLLHUP as u32, "HUP "),
        (libc::POLLRDHUP as u32, "RDHUP "),
        (libc::POLLERR as u32, "ERR "),
        (libc::POLLNVAL as u32, "NVAL "),
    ] {
        if events & bit != 0 {
            _ = out.write_str(name);
        }
    }
    out
}

impl Drop for Channel {
    fn drop(&mut self) {
        assert!(!self.event_handling.get());
        assert!(!self.added_to_loop.get());
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.get())
            .field("revents", &self.revents.get())
            .field("index", &self.index.get())
            .finish_non_exhaustive()
    }
}
