//! `epoll(7)` backend.
//!
//! Channels are identified by their fd in `epoll_data`, looked up in the
//! channel table on the way out. The per-channel index tracks membership:
//! never added, added, or parked (removed from the epoll set but still
//! known here, so a later re-enable uses `EPOLL_CTL_ADD` again).

use crate::channel::{Channel, INDEX_NEW};
use muxio_timer::Timestamp;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

const INDEX_ADDED: i32 = 1;
const INDEX_PARKED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![empty_event(); INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        crate::trace!("fd total count {}", self.channels.len());
        let num = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();
        if num > 0 {
            crate::trace!("{num} events happened");
            self.fill_active_channels(num as usize, active);
            if num as usize == self.events.len() {
                // saturated; give the next wait room for more
                self.events.resize(self.events.len() * 2, empty_event());
            }
        } else if num == 0 {
            crate::trace!("nothing happened");
        } else if saved.kind() != io::ErrorKind::Interrupted {
            crate::error!("EpollPoller::poll(): {saved}");
        }
        now
    }

    fn fill_active_channels(&self, num: usize, active: &mut Vec<Rc<Channel>>) {
        assert!(num <= self.events.len());
        for event in &self.events[..num] {
            let fd = event.u64 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.set_revents(event.events);
                active.push(channel.clone());
            }
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        let index = channel.index();
        crate::trace!(
            "epoll update fd = {} events = {} index = {index}",
            channel.fd(),
            channel.events()
        );
        if index == INDEX_NEW || index == INDEX_PARKED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&channel.fd()));
                _ = self.channels.insert(channel.fd(), channel.clone());
            } else {
                assert!(self.channels.contains_key(&channel.fd()));
            }
            channel.set_index(INDEX_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&channel.fd()));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_PARKED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Rc<Channel>) {
        crate::trace!("epoll remove fd = {}", channel.fd());
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_PARKED);
        _ = self.channels.remove(&channel.fd());
        if index == INDEX_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |c| Rc::ptr_eq(c, channel))
    }

    fn update(&self, op: libc::c_int, channel: &Rc<Channel>) {
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: channel.fd() as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, channel.fd(), &mut event) };
        if rc < 0 {
            let saved = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                crate::error!("epoll_ctl op = DEL fd = {}: {saved}", channel.fd());
            } else {
                panic!("epoll_ctl op = {op} fd = {}: {saved}", channel.fd());
            }
        }
    }
}

fn empty_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

impl fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollPoller")
            .field("epoll_fd", &self.epoll_fd.as_raw_fd())
            .field("capacity", &self.events.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}
