//! Timer callbacks multiplexed over one `timerfd`.
//!
//! The queue keeps two indexes: an ordering heap of `(expiration, id)`
//! pairs and an identity table owning the callbacks. Cancellation only
//! touches the table; heap entries without a live identity are stale and
//! get dropped while processing expirations. The `timerfd` is always
//! armed for the earliest live deadline and never carries a kernel-side
//! interval, repeats are re-queued here.

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::poller::Poller;
use muxio_timer::{TimerHeap, TimerId, Timestamp};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One scheduled callback.
pub(crate) struct Timer {
    id: TimerId,
    callback: Box<dyn FnMut() + Send>,
    expiration: Timestamp,
    interval: Option<Duration>,
}

impl Timer {
    pub(crate) fn new(
        callback: Box<dyn FnMut() + Send>,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> Timer {
        Timer {
            id: TimerId::next(),
            callback,
            expiration: when,
            interval,
        }
    }

    pub(crate) fn id(&self) -> TimerId {
        self.id
    }

    fn run(&mut self) {
        (self.callback)();
    }

    fn repeat(&self) -> bool {
        self.interval.is_some()
    }

    fn restart(&mut self, now: Timestamp) {
        if let Some(interval) = self.interval {
            self.expiration = now + interval;
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("expiration", &self.expiration)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

// floor passed to timerfd_settime; a deadline already in the past still
// needs a positive relative value to fire
const MIN_DELAY_MICROS: i64 = 100;

fn create_timer_fd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn reset_timer_fd(fd: RawFd, expiration: Timestamp) {
    let micros = (expiration.micros() - Timestamp::now().micros()).max(MIN_DELAY_MICROS);
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (micros / 1_000_000) as libc::time_t,
            tv_nsec: ((micros % 1_000_000) * 1000) as libc::c_long,
        },
    };
    let rc = unsafe { libc::timerfd_settime(fd, 0, &new_value, std::ptr::null_mut()) };
    if rc != 0 {
        crate::error!("timerfd_settime(): {}", io::Error::last_os_error());
    }
}

fn read_timer_fd(fd: RawFd, now: Timestamp) {
    let mut how_many: u64 = 0;
    let n = unsafe { libc::read(fd, std::ptr::addr_of_mut!(how_many).cast(), 8) };
    crate::trace!("TimerQueue::handle_read() {how_many} at {now}");
    if n != 8 {
        crate::error!("TimerQueue::handle_read() reads {n} bytes instead of 8");
    }
}

pub(crate) struct TimerQueue {
    event_loop: Weak<EventLoop>,
    timer_fd: OwnedFd,
    channel: Rc<Channel>,
    /// Ordering index; may hold stale entries after a cancel.
    timers: RefCell<TimerHeap>,
    /// Identity index; owns the callbacks.
    active: RefCell<HashMap<TimerId, Timer>>,
    /// Repeats cancelled while checked out by the expiry pass.
    cancelled_in_pass: RefCell<HashSet<TimerId>>,
    in_expiry_pass: Cell<bool>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: &Arc<EventLoop>) -> io::Result<Rc<TimerQueue>> {
        let timer_fd = create_timer_fd()?;
        let channel = Channel::new(event_loop, timer_fd.as_raw_fd());
        let queue = Rc::new(TimerQueue {
            event_loop: Arc::downgrade(event_loop),
            timer_fd,
            channel: Rc::clone(&channel),
            timers: RefCell::new(TimerHeap::new()),
            active: RefCell::new(HashMap::new()),
            cancelled_in_pass: RefCell::new(HashSet::new()),
            in_expiry_pass: Cell::new(false),
        });
        let weak = Rc::downgrade(&queue);
        channel.set_read_callback(move |now| {
            if let Some(queue) = weak.upgrade() {
                queue.handle_read(now);
            }
        });
        channel.enable_reading();
        Ok(queue)
    }

    pub(crate) fn add_timer_in_loop(&self, timer: Timer) {
        self.assert_in_loop();
        let when = timer.expiration;
        if self.insert(timer) {
            reset_timer_fd(self.timer_fd.as_raw_fd(), when);
        }
    }

    pub(crate) fn cancel_in_loop(&self, id: TimerId) {
        self.assert_in_loop();
        if self.active.borrow_mut().remove(&id).is_none() && self.in_expiry_pass.get() {
            // checked out by the running expiry pass; stop its repeat
            _ = self.cancelled_in_pass.borrow_mut().insert(id);
        }
        // the heap entry, if any, goes stale and is pruned lazily
    }

    // drops the channel registration during loop teardown
    pub(crate) fn detach(&self, poller: &mut Poller) {
        self.channel.clear_interest();
        poller.remove_channel(&self.channel);
        self.channel.mark_detached();
    }

    fn handle_read(&self, _poll_time: Timestamp) {
        self.assert_in_loop();
        let now = Timestamp::now();
        read_timer_fd(self.timer_fd.as_raw_fd(), now);
        let mut expired = self.take_expired(now);
        self.in_expiry_pass.set(true);
        // no RefCell is held here: callbacks may add or cancel timers
        for timer in &mut expired {
            timer.run();
        }
        self.in_expiry_pass.set(false);
        self.reschedule(expired, now);
    }

    /// Checks every due timer out of both indexes, in expiration order.
    fn take_expired(&self, now: Timestamp) -> Vec<Timer> {
        let mut expired = Vec::new();
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        while let Some((_, id)) = timers.pop_due(now) {
            if let Some(timer) = active.remove(&id) {
                expired.push(timer);
            }
        }
        expired
    }

    fn reschedule(&self, expired: Vec<Timer>, now: Timestamp) {
        {
            let mut cancelled = self.cancelled_in_pass.borrow_mut();
            for mut timer in expired {
                if timer.repeat() && !cancelled.remove(&timer.id) {
                    timer.restart(now);
                    _ = self.insert(timer);
                }
            }
            cancelled.clear();
        }
        // prune stale heads before arming for the next live deadline
        let next = loop {
            let head = self.timers.borrow().earliest();
            match head {
                None => break None,
                Some((when, id)) => {
                    if self.active.borrow().contains_key(&id) {
                        break Some(when);
                    }
                    _ = self.timers.borrow_mut().pop();
                }
            }
        };
        if let Some(when) = next {
            reset_timer_fd(self.timer_fd.as_raw_fd(), when);
        }
    }

    fn insert(&self, timer: Timer) -> bool {
        let when = timer.expiration;
        let id = timer.id;
        let earliest_changed = self.timers.borrow_mut().insert(when, id);
        _ = self.active.borrow_mut().insert(id, timer);
        earliest_changed
    }

    fn assert_in_loop(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.assert_in_loop_thread();
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timer_fd", &self.timer_fd.as_raw_fd())
            .field("queued", &self.timers.borrow().len())
            .field("active", &self.active.borrow().len())
            .finish_non_exhaustive()
    }
}
