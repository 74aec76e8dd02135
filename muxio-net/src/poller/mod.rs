//! Readiness multiplexing behind one closed enum.
//!
//! Two backends exist, `epoll(7)` and `poll(2)`, and both translate their
//! results into the channel's `poll`-style bits. The epoll backend is the
//! default; setting the `MUXIO_USE_POLL` environment variable forces the
//! portable one.

mod epoll;
mod poll;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

use crate::channel::Channel;
use muxio_timer::Timestamp;
use std::fmt;
use std::io;
use std::rc::Rc;

pub(crate) enum Poller {
    Poll(PollPoller),
    Epoll(EpollPoller),
}

impl Poller {
    /// Picks epoll when it is available, poll otherwise.
    pub(crate) fn new_default() -> io::Result<Poller> {
        if std::env::var_os("MUXIO_USE_POLL").is_some() {
            return Ok(Poller::Poll(PollPoller::new()));
        }
        match EpollPoller::new() {
            Ok(poller) => Ok(Poller::Epoll(poller)),
            Err(e) => {
                crate::warn!("epoll unavailable, falling back to poll(2): {e}");
                Ok(Poller::Poll(PollPoller::new()))
            }
        }
    }

    /// Blocks for at most `timeout_ms`, fills `active` with every channel
    /// that has readiness pending, and returns the wakeup time.
    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        match self {
            Poller::Poll(p) => p.poll(timeout_ms, active),
            Poller::Epoll(p) => p.poll(timeout_ms, active),
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        match self {
            Poller::Poll(p) => p.update_channel(channel),
            Poller::Epoll(p) => p.update_channel(channel),
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Rc<Channel>) {
        match self {
            Poller::Poll(p) => p.remove_channel(channel),
            Poller::Epoll(p) => p.remove_channel(channel),
        }
    }

    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        match self {
            Poller::Poll(p) => p.has_channel(channel),
            Poller::Epoll(p) => p.has_channel(channel),
        }
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Poller::Poll(p) => f.debug_tuple("Poller::Poll").field(p).finish(),
            Poller::Epoll(p) => f.debug_tuple("Poller::Epoll").field(p).finish(),
        }
    }
}
