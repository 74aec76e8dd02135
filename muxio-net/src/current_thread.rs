//! Cheap numeric identity for the current thread.
//!
//! Loop affinity checks compare thread ids on every channel update, so the
//! id is cached in a thread-local instead of going through `Thread::id`.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CACHED_TID: Cell<u64> = Cell::new(0);
}

/// Returns this thread's id. Never zero.
#[must_use]
pub fn tid() -> u64 {
    CACHED_TID.with(|cell| {
        let mut tid = cell.get();
        if tid == 0 {
            tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
            cell.set(tid);
        }
        tid
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_is_stable_within_a_thread() {
        assert_ne!(tid(), 0);
        assert_eq!(tid(), tid());
    }

    #[test]
    fn tid_differs_across_threads() {
        let mine = tid();
        let theirs = std::thread::spawn(tid).join().unwrap();
        assert_ne!(mine, theirs);
    }
}
