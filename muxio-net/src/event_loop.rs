//! The reactor core: one loop per thread.
//!
//! A loop created on a thread belongs to that thread for its whole life;
//! a global registry rejects a second loop on the same thread. The loop
//! body is poll, dispatch ready channels, then run tasks marshalled from
//! other threads. An `eventfd` channel breaks the poll wait whenever a
//! foreign thread queues work or asks the loop to quit.

use crate::channel::Channel;
use crate::current_thread;
use crate::poller::Poller;
use crate::timer_queue::{Timer, TimerQueue};
use dashmap::DashMap;
use muxio_timer::{Timestamp, TimerId};
use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

/// A unit of work marshalled onto a loop from another thread.
pub type Task = Box<dyn FnOnce() + Send>;

// bounded wait so a quit flag set without a wakeup is still noticed
const POLL_TIME_MS: i32 = 1000;

// one loop per thread, enforced at construction
static LOOP_REGISTRY: Lazy<DashMap<u64, ()>> = Lazy::new(DashMap::new);

static IGNORE_SIGPIPE: Once = Once::new();

fn create_event_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A single-threaded reactor.
///
/// Shared across threads as `Arc<EventLoop>`, but only the owning thread
/// may drive it or touch its channels; everyone else goes through
/// [`EventLoop::run_in_loop`] and the timer methods.
pub struct EventLoop {
    tid: u64,
    looping: Cell<bool>,
    quit: AtomicBool,
    event_handling: Cell<bool>,
    calling_pending_tasks: AtomicBool,
    iteration: Cell<u64>,
    poll_return_time: Cell<Timestamp>,
    poller: RefCell<Poller>,
    timer_queue: OnceCell<Rc<TimerQueue>>,
    wakeup_fd: OwnedFd,
    wakeup_channel: OnceCell<Rc<Channel>>,
    pending_tasks: Mutex<Vec<Task>>,
}

// The non-atomic state is only touched from the owning thread; the
// affinity asserts uphold that at runtime. Foreign threads are limited to
// the task queue, the atomics and the wakeup fd.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Creates a loop bound to the calling thread.
    ///
    /// The first loop in the process also ignores `SIGPIPE`, so writes to
    /// reset peers surface as `EPIPE` instead of killing the process.
    ///
    /// # Errors
    /// if the poller, the wakeup `eventfd` or the `timerfd` cannot be
    /// created
    ///
    /// # Panics
    /// if this thread already owns a loop
    pub fn new() -> io::Result<Arc<EventLoop>> {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            _ = nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            );
        });
        let tid = current_thread::tid();
        let poller = Poller::new_default()?;
        let wakeup_fd = create_event_fd()?;
        assert!(
            LOOP_REGISTRY.insert(tid, ()).is_none(),
            "another EventLoop already exists on thread {tid}"
        );
        let event_loop = Arc::new(EventLoop {
            tid,
            looping: Cell::new(false),
            quit: AtomicBool::new(false),
            event_handling: Cell::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            iteration: Cell::new(0),
            poll_return_time: Cell::new(Timestamp::default()),
            poller: RefCell::new(poller),
            timer_queue: OnceCell::new(),
            wakeup_fd,
            wakeup_channel: OnceCell::new(),
            pending_tasks: Mutex::new(Vec::new()),
        });
        let wakeup_channel = Channel::new(&event_loop, event_loop.wakeup_fd.as_raw_fd());
        let weak = Arc::downgrade(&event_loop);
        wakeup_channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_wakeup_read();
            }
        });
        wakeup_channel.enable_reading();
        assert!(event_loop.wakeup_channel.set(wakeup_channel).is_ok());
        // on failure the Arc drops here and Drop cleans up the registry
        let timer_queue = TimerQueue::new(&event_loop)?;
        assert!(event_loop.timer_queue.set(timer_queue).is_ok());
        crate::debug!("EventLoop created on thread {tid}");
        Ok(event_loop)
    }

    /// Runs the loop until [`EventLoop::quit`] is called. Must run on the
    /// owning thread.
    ///
    /// # Panics
    /// if called from a foreign thread or reentrantly
    pub fn run(&self) {
        assert!(!self.looping.get(), "EventLoop::run() called reentrantly");
        self.assert_in_loop_thread();
        self.looping.set(true);
        // the quit flag is never reset: a quit() that lands before run()
        // must stop the loop, not get clobbered
        crate::trace!("EventLoop of thread {} start looping", self.tid);
        let mut active: Vec<Rc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let now = self.poller.borrow_mut().poll(POLL_TIME_MS, &mut active);
            self.poll_return_time.set(now);
            self.iteration.set(self.iteration.get() + 1);
            self.event_handling.set(true);
            for channel in &active {
                channel.handle_event(now);
            }
            self.event_handling.set(false);
            self.do_pending_tasks();
        }
        // drain late arrivals so teardown tasks queued around quit still
        // run, including tasks the drained tasks queue in turn
        loop {
            let drained = self
                .pending_tasks
                .lock()
                .expect("pending task queue poisoned")
                .is_empty();
            if drained {
                break;
            }
            self.do_pending_tasks();
        }
        crate::trace!("EventLoop of thread {} stop looping", self.tid);
        self.looping.set(false);
    }

    /// Asks the loop to stop after the current iteration, or makes a
    /// not-yet-started [`EventLoop::run`] return immediately. Callable
    /// from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` immediately when called on the owning thread,
    /// otherwise queues it and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the owning thread, never running it inline.
    ///
    /// Also used from the owning thread itself to defer work until after
    /// the current dispatch, e.g. while the loop is already draining the
    /// task queue.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            self.pending_tasks
                .lock()
                .expect("pending task queue poisoned")
                .push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Schedules `cb` at the absolute instant `when`. Callable from any
    /// thread.
    pub fn run_at(self: &Arc<Self>, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Timer::new(Box::new(cb), when, None))
    }

    /// Schedules `cb` once, `delay` from now. Callable from any thread.
    pub fn run_after(
        self: &Arc<Self>,
        delay: Duration,
        cb: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.run_at(Timestamp::now() + delay, cb)
    }

    /// Schedules `cb` every `interval`, first firing one interval from
    /// now. Callable from any thread.
    ///
    /// A repeating timer re-arms from the moment its callback ran, so an
    /// overloaded loop skips ticks instead of bursting to catch up.
    pub fn run_every(
        self: &Arc<Self>,
        interval: Duration,
        cb: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.add_timer(Timer::new(
            Box::new(cb),
            Timestamp::now() + interval,
            Some(interval),
        ))
    }

    /// Cancels a scheduled timer. Callable from any thread; cancelling an
    /// already fired or unknown timer is a no-op, and a repeating timer
    /// cancelled from inside its own callback does not fire again.
    pub fn cancel(self: &Arc<Self>, timer_id: TimerId) {
        let event_loop = Arc::clone(self);
        self.run_in_loop(move || event_loop.timer_queue().cancel_in_loop(timer_id));
    }

    fn add_timer(self: &Arc<Self>, timer: Timer) -> TimerId {
        let id = timer.id();
        let event_loop = Arc::clone(self);
        self.run_in_loop(move || event_loop.timer_queue().add_timer_in_loop(timer));
        id
    }

    fn timer_queue(&self) -> &Rc<TimerQueue> {
        self.timer_queue.get().expect("timer queue not initialized")
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    /// `true` when `channel` is registered with this loop's poller.
    #[must_use]
    pub fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// `true` when the calling thread owns this loop.
    #[must_use]
    pub fn is_in_loop_thread(&self) -> bool {
        self.tid == current_thread::tid()
    }

    /// Aborts when called from a foreign thread.
    ///
    /// # Panics
    /// if the calling thread does not own this loop
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop owned by thread {} was touched from thread {}",
            self.tid,
            current_thread::tid()
        );
    }

    /// `true` while the loop is dispatching channel events.
    #[must_use]
    pub fn event_handling(&self) -> bool {
        self.event_handling.get()
    }

    /// Completed poll iterations so far.
    #[must_use]
    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    /// When the last poll call returned.
    #[must_use]
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                std::ptr::addr_of!(one).cast(),
                8,
            )
        };
        if n != 8 {
            crate::error!("EventLoop::wakeup() writes {n} bytes instead of 8");
        }
    }

    fn handle_wakeup_read(&self) {
        let mut one: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                std::ptr::addr_of_mut!(one).cast(),
                8,
            )
        };
        if n != 8 {
            crate::error!("EventLoop::handle_wakeup_read() reads {n} bytes instead of 8");
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);
        // swap the queue out so tasks queueing more tasks don't deadlock
        // on the mutex and newly queued work lands in the next iteration
        let tasks = std::mem::take(
            &mut *self
                .pending_tasks
                .lock()
                .expect("pending task queue poisoned"),
        );
        for task in tasks {
            task();
        }
        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        crate::debug!("EventLoop of thread {} destructs", self.tid);
        // internal channels are detached by hand: the owning Arc is gone,
        // so the Weak-based channel update path is unusable here
        if let Some(timer_queue) = self.timer_queue.take() {
            timer_queue.detach(self.poller.get_mut());
        }
        if let Some(channel) = self.wakeup_channel.take() {
            channel.clear_interest();
            self.poller.get_mut().remove_channel(&channel);
            channel.mark_detached();
        }
        _ = LOOP_REGISTRY.remove(&self.tid);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("tid", &self.tid)
            .field("looping", &self.looping.get())
            .field("iteration", &self.iteration.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn run_in_loop_is_synchronous_on_the_owning_thread() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        event_loop.run_in_loop(move || flag.store(true, Ordering::Release));
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    #[should_panic(expected = "another EventLoop already exists")]
    fn second_loop_on_the_same_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new().unwrap();
    }

    #[test]
    fn foreign_thread_tasks_are_deferred_and_run_on_the_owner() {
        let event_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let remote = Arc::clone(&event_loop);
        let handle = thread::spawn(move || {
            let tx = tx.clone();
            remote.run_in_loop(move || {
                _ = tx.send(current_thread::tid());
            });
            // nothing can have run yet, the owner is not looping
            assert_eq!(
                remote
                    .pending_tasks
                    .lock()
                    .map(|q| q.len())
                    .unwrap_or_default(),
                1
            );
            let stopper = Arc::clone(&remote);
            remote.run_in_loop(move || stopper.quit());
        });
        handle.join().unwrap();
        event_loop.run();
        assert_eq!(rx.try_recv().unwrap(), current_thread::tid());
    }

    #[test]
    fn quit_from_another_thread_wakes_the_poll() {
        let event_loop = EventLoop::new().unwrap();
        let remote = Arc::clone(&event_loop);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.quit();
        });
        let start = Instant::now();
        event_loop.run();
        handle.join().unwrap();
        // well under the 1s poll timeout, so the eventfd did the waking
        assert!(start.elapsed() < Duration::from_millis(900));
    }

    #[test]
    fn run_after_fires_once() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        _ = event_loop.run_after(Duration::from_millis(20), move || {
            _ = count.fetch_add(1, Ordering::AcqRel);
        });
        // stop only well past the first expiration, so a buggy repeat
        // would have had time to fire again
        let stopper = Arc::clone(&event_loop);
        _ = event_loop.run_after(Duration::from_millis(80), move || stopper.quit());
        event_loop.run();
        assert_eq!(fired.load(Ordering::Acquire), 1);
    }

    #[test]
    fn quit_before_run_stops_the_loop_immediately() {
        let event_loop = EventLoop::new().unwrap();
        event_loop.quit();
        let start = Instant::now();
        event_loop.run();
        // never entered the poll wait
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn run_every_repeats_until_cancelled() {
        let event_loop = EventLoop::new().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&ticks);
        let stopper = Arc::clone(&event_loop);
        let start = Instant::now();
        _ = event_loop.run_every(Duration::from_millis(20), move || {
            if count.fetch_add(1, Ordering::AcqRel) + 1 == 3 {
                stopper.quit();
            }
        });
        event_loop.run();
        assert_eq!(ticks.load(Ordering::Acquire), 3);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn cancel_prevents_firing() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let doomed = event_loop.run_after(Duration::from_millis(10), move || {
            flag.store(true, Ordering::Release);
        });
        event_loop.cancel(doomed);
        let stopper = Arc::clone(&event_loop);
        _ = event_loop.run_after(Duration::from_millis(50), move || stopper.quit());
        event_loop.run();
        assert!(!fired.load(Ordering::Acquire));
    }

    #[test]
    fn repeating_timer_cancelled_from_its_own_callback_stops() {
        let event_loop = EventLoop::new().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let id_cell = Arc::new(Mutex::new(None::<TimerId>));
        let count = Arc::clone(&ticks);
        let slot = Arc::clone(&id_cell);
        let canceller = Arc::clone(&event_loop);
        let id = event_loop.run_every(Duration::from_millis(10), move || {
            _ = count.fetch_add(1, Ordering::AcqRel);
            if let Some(id) = *slot.lock().unwrap() {
                canceller.cancel(id);
            }
        });
        *id_cell.lock().unwrap() = Some(id);
        let stopper = Arc::clone(&event_loop);
        _ = event_loop.run_after(Duration::from_millis(80), move || stopper.quit());
        event_loop.run();
        assert_eq!(ticks.load(Ordering::Acquire), 1);
    }

    #[test]
    fn timers_fire_in_expiration_order() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, label) in [(30, "late"), (10, "early"), (20, "middle")] {
            let order = Arc::clone(&order);
            _ = event_loop.run_after(Duration::from_millis(delay), move || {
                order.lock().unwrap().push(label);
            });
        }
        let stopper = Arc::clone(&event_loop);
        _ = event_loop.run_after(Duration::from_millis(60), move || stopper.quit());
        event_loop.run();
        assert_eq!(*order.lock().unwrap(), ["early", "middle", "late"]);
    }
}
