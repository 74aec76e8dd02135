#![warn(
    anonymous_parameters,
    bare_trait_objects,
    elided_lifetimes_in_paths,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    clippy::all,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! Timestamps, timer identities and the ordering heap for the muxio reactor.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Microseconds per second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// A wall-clock instant with microsecond resolution.
///
/// The default value is invalid and compares earlier than any instant
/// ever returned by [`Timestamp::now`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Builds a timestamp from microseconds since the unix epoch.
    #[must_use]
    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    /// The current wall clock.
    ///
    /// # Panics
    /// if the system clock is set before `UNIX_EPOCH`
    #[must_use]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is set before 1970-01-01 00:00:00 UTC");
        Timestamp(i64::try_from(since_epoch.as_micros()).unwrap_or(i64::MAX))
    }

    /// Returns `true` for instants actually produced by a clock.
    #[must_use]
    pub fn valid(self) -> bool {
        self.0 > 0
    }

    /// Microseconds since the unix epoch.
    #[must_use]
    pub fn micros(self) -> i64 {
        self.0
    }

    /// Whole seconds since the unix epoch.
    #[must_use]
    pub fn secs(self) -> i64 {
        self.0 / MICROS_PER_SECOND
    }

    /// Time elapsed since `earlier`, saturating to zero when `earlier`
    /// is in fact later.
    #[must_use]
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        let micros = self.0.saturating_sub(earlier.0).max(0);
        Duration::from_micros(micros as u64)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let micros = i64::try_from(rhs.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_SECOND,
            self.0.rem_euclid(MICROS_PER_SECOND)
        )
    }
}

static TIMER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of one scheduled timer.
///
/// Identities are handed out in creation order, which also breaks ties
/// between timers sharing an expiration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Allocates the next identity.
    #[must_use]
    pub fn next() -> Self {
        TimerId(TIMER_SEQUENCE.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// The raw sequence number.
    #[must_use]
    pub fn sequence(self) -> u64 {
        self.0
    }
}

/// Min-heap over `(expiration, identity)` pairs.
///
/// The heap only orders timers; whoever owns it keeps the callbacks in a
/// separate identity table and treats heap entries without a live owner
/// as stale.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<(Timestamp, TimerId)>>,
}

impl TimerHeap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        TimerHeap::default()
    }

    /// Queues an entry.
    ///
    /// Returns `true` when the new entry became the earliest, meaning the
    /// owner has to re-arm whatever clock source watches this heap.
    pub fn insert(&mut self, when: Timestamp, id: TimerId) -> bool {
        let earliest_changed = self.earliest().map_or(true, |e| (when, id) < e);
        self.heap.push(Reverse((when, id)));
        earliest_changed
    }

    /// The earliest queued entry, without removing it.
    #[must_use]
    pub fn earliest(&self) -> Option<(Timestamp, TimerId)> {
        self.heap.peek().map(|Reverse(pair)| *pair)
    }

    /// Removes and returns the earliest entry.
    pub fn pop(&mut self) -> Option<(Timestamp, TimerId)> {
        self.heap.pop().map(|Reverse(pair)| pair)
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(Timestamp, TimerId)> {
        match self.heap.peek() {
            Some(Reverse((when, _))) if *when <= now => self.pop(),
            _ => None,
        }
    }

    /// Returns the number of queued entries, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_valid() {
        let now = Timestamp::now();
        assert!(now.valid());
        assert!(!Timestamp::default().valid());
        assert!(Timestamp::default() < now);
    }

    #[test]
    fn add_and_duration_since() {
        let start = Timestamp::from_micros(1_000_000);
        let later = start + Duration::from_millis(1500);
        assert_eq!(later.micros(), 2_500_000);
        assert_eq!(later.duration_since(start), Duration::from_millis(1500));
        assert_eq!(start.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn display_pads_micros() {
        let ts = Timestamp::from_micros(3 * MICROS_PER_SECOND + 42);
        assert_eq!(ts.to_string(), "3.000042");
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let a = TimerId::next();
        let b = TimerId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn heap_pops_in_expiration_order() {
        let mut heap = TimerHeap::new();
        let t1 = Timestamp::from_micros(100);
        let t2 = Timestamp::from_micros(200);
        let t3 = Timestamp::from_micros(300);
        let (a, b, c) = (TimerId::next(), TimerId::next(), TimerId::next());
        assert!(heap.insert(t2, b));
        assert!(!heap.insert(t3, c));
        assert!(heap.insert(t1, a));
        assert_eq!(heap.pop(), Some((t1, a)));
        assert_eq!(heap.pop(), Some((t2, b)));
        assert_eq!(heap.pop(), Some((t3, c)));
        assert!(heap.is_empty());
    }

    #[test]
    fn ties_break_by_creation_order() {
        let mut heap = TimerHeap::new();
        let when = Timestamp::from_micros(100);
        let first = TimerId::next();
        let second = TimerId::next();
        assert!(heap.insert(when, second));
        assert!(heap.insert(when, first));
        assert_eq!(heap.pop(), Some((when, first)));
        assert_eq!(heap.pop(), Some((when, second)));
    }

    #[test]
    fn pop_due_respects_now() {
        let mut heap = TimerHeap::new();
        let id = TimerId::next();
        let when = Timestamp::from_micros(500);
        assert!(heap.insert(when, id));
        assert_eq!(heap.pop_due(Timestamp::from_micros(499)), None);
        assert_eq!(heap.pop_due(Timestamp::from_micros(500)), Some((when, id)));
        assert_eq!(heap.len(), 0);
    }
}
