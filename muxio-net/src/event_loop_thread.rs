//! A thread whose whole job is running one event loop.

use crate::event_loop::EventLoop;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Runs on the new thread right before its loop starts.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

type LoopSlot = Arc<(Mutex<Option<io::Result<Arc<EventLoop>>>>, Condvar)>;

/// Owns a spawned thread and the loop living on it. Dropping quits the
/// loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    slot: LoopSlot,
    init_cb: Option<ThreadInitCallback>,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Creates a not yet started loop thread. Without a `name` a unique
    /// one is generated.
    #[must_use]
    pub fn new(name: Option<String>, init_cb: Option<ThreadInitCallback>) -> Self {
        EventLoopThread {
            name: name.unwrap_or_else(|| format!("event-loop-{}", uuid::Uuid::new_v4())),
            slot: Arc::new((Mutex::new(None), Condvar::new())),
            init_cb,
            event_loop: None,
            thread: None,
        }
    }

    /// Spawns the thread and blocks until its loop is running (or its
    /// creation failed).
    ///
    /// # Errors
    /// if the thread cannot be spawned or the loop cannot be created
    ///
    /// # Panics
    /// if called twice
    pub fn start_loop(&mut self) -> io::Result<Arc<EventLoop>> {
        assert!(self.thread.is_none(), "loop thread already started");
        let slot = Arc::clone(&self.slot);
        let init_cb = self.init_cb.take();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let (lock, cvar) = &*slot;
                match EventLoop::new() {
                    Ok(event_loop) => {
                        if let Some(cb) = &init_cb {
                            cb(&event_loop);
                        }
                        *lock.lock().expect("loop slot poisoned") =
                            Some(Ok(Arc::clone(&event_loop)));
                        cvar.notify_one();
                        event_loop.run();
                    }
                    Err(e) => {
                        *lock.lock().expect("loop slot poisoned") = Some(Err(e));
                        cvar.notify_one();
                    }
                }
            })?;
        self.thread = Some(handle);
        let (lock, cvar) = &*self.slot;
        let mut published = lock.lock().expect("loop slot poisoned");
        while published.is_none() {
            published = cvar.wait(published).expect("loop slot poisoned");
        }
        let event_loop = published.take().expect("loop slot emptied concurrently")?;
        drop(published);
        self.event_loop = Some(Arc::clone(&event_loop));
        Ok(event_loop)
    }

    /// The thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(handle) = self.thread.take() {
            _ = handle.join();
        }
    }
}

impl fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThread")
            .field("name", &self.name)
            .field("started", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_thread;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;

    #[test]
    fn loop_runs_on_its_own_thread() {
        let mut thread = EventLoopThread::new(Some("lt-test".into()), None);
        let event_loop = thread.start_loop().unwrap();
        assert!(!event_loop.is_in_loop_thread());
        let (tx, rx) = mpsc::channel();
        event_loop.run_in_loop(move || {
            _ = tx.send(current_thread::tid());
        });
        let loop_tid = rx.recv().unwrap();
        assert_ne!(loop_tid, current_thread::tid());
    }

    #[test]
    fn init_callback_runs_before_the_loop() {
        let seen = Arc::new(AtomicU64::new(0));
        let tid = Arc::clone(&seen);
        let mut thread = EventLoopThread::new(
            None,
            Some(Arc::new(move |_event_loop: &Arc<EventLoop>| {
                tid.store(current_thread::tid(), Ordering::Release);
            })),
        );
        let _event_loop = thread.start_loop().unwrap();
        let init_tid = seen.load(Ordering::Acquire);
        assert_ne!(init_tid, 0);
        assert_ne!(init_tid, current_thread::tid());
    }

    #[test]
    fn drop_quits_and_joins() {
        let mut thread = EventLoopThread::new(None, None);
        let event_loop = thread.start_loop().unwrap();
        drop(thread);
        // the loop stopped; tasks queued now are only drained at drop
        assert!(!event_loop.is_in_loop_thread());
    }
}
