//! A fixed set of I/O loop threads fronted by round-robin handout.
//!
//! With zero threads the base loop does everything itself; that is the
//! single-threaded mode. The pool never grows or shrinks after start.

use crate::event_loop::EventLoop;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Owns the I/O loop threads belonging to one base loop.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    /// Creates an empty, not yet started pool.
    #[must_use]
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Sets how many I/O threads [`EventLoopThreadPool::start`] spawns.
    /// Zero keeps all I/O on the base loop.
    pub fn set_thread_num(&self, num: usize) {
        self.num_threads.store(num, Ordering::Release);
    }

    /// Spawns the threads and waits for every loop to come up. `init_cb`
    /// runs on each new thread first; with zero threads it runs on the
    /// base loop's thread instead.
    ///
    /// # Errors
    /// if a thread cannot be spawned or a loop cannot be created
    ///
    /// # Panics
    /// off the base loop's thread, or when already started
    pub fn start(&self, init_cb: Option<ThreadInitCallback>) -> io::Result<()> {
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "pool already started"
        );
        self.base_loop.assert_in_loop_thread();
        let num = self.num_threads.load(Ordering::Acquire);
        let mut threads = self.threads.lock().expect("pool thread list poisoned");
        let mut loops = self.loops.lock().expect("pool loop list poisoned");
        for i in 0..num {
            let mut thread =
                EventLoopThread::new(Some(format!("{}-{i}", self.name)), init_cb.clone());
            loops.push(thread.start_loop()?);
            threads.push(thread);
        }
        if num == 0 {
            if let Some(cb) = init_cb {
                cb(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Deals out the next loop round-robin; the base loop when the pool
    /// is empty.
    ///
    /// # Panics
    /// off the base loop's thread, or before start
    #[must_use]
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire), "pool not started");
        let loops = self.loops.lock().expect("pool loop list poisoned");
        if loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let idx = self.next.fetch_add(1, Ordering::AcqRel) % loops.len();
        Arc::clone(&loops[idx])
    }

    /// Deterministically maps `hash` to a loop, so the same key always
    /// lands on the same thread.
    ///
    /// # Panics
    /// off the base loop's thread, or before start
    #[must_use]
    pub fn get_loop_for_hash(&self, hash: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire), "pool not started");
        let loops = self.loops.lock().expect("pool loop list poisoned");
        if loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        Arc::clone(&loops[hash % loops.len()])
    }

    /// Every loop in the pool; just the base loop when empty.
    #[must_use]
    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().expect("pool loop list poisoned");
        if loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            loops.clone()
        }
    }

    /// `true` once [`EventLoopThreadPool::start`] ran.
    #[must_use]
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The pool's name, used as the thread name prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("threads", &self.num_threads.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(Arc::clone(&base), "empty-pool");
        pool.start(None).unwrap();
        assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
        assert!(Arc::ptr_eq(&pool.get_loop_for_hash(42), &base));
        assert_eq!(pool.get_all_loops().len(), 1);
    }

    #[test]
    fn round_robin_cycles_through_all_loops() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(Arc::clone(&base), "rr-pool");
        pool.set_thread_num(3);
        pool.start(None).unwrap();
        let first_cycle: Vec<_> = (0..3).map(|_| pool.get_next_loop()).collect();
        let second_cycle: Vec<_> = (0..3).map(|_| pool.get_next_loop()).collect();
        for (a, b) in first_cycle.iter().zip(&second_cycle) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert!(!Arc::ptr_eq(&first_cycle[0], &first_cycle[1]));
        assert!(!Arc::ptr_eq(&first_cycle[1], &first_cycle[2]));
        assert!(!Arc::ptr_eq(&first_cycle[0], &first_cycle[2]));
        for event_loop in &first_cycle {
            assert!(!Arc::ptr_eq(event_loop, &base));
        }
    }

    #[test]
    fn hash_mapping_is_stable() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(Arc::clone(&base), "hash-pool");
        pool.set_thread_num(2);
        pool.start(None).unwrap();
        let a = pool.get_loop_for_hash(7);
        let b = pool.get_loop_for_hash(7);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
