//! `poll(2)` backend.
//!
//! Keeps one `pollfd` per registered channel. A channel with no interest
//! stays in the array but its slot fd is negated (`-fd - 1`, since fd 0
//! is legal), which `poll(2)` ignores; re-enabling flips it back without
//! shifting the array.

use crate::channel::{Channel, INDEX_NEW};
use muxio_timer::Timestamp;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl PollPoller {
    pub(crate) fn new() -> Self {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    pub(crate) fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Rc<Channel>>) -> Timestamp {
        let num = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();
        if num > 0 {
            crate::trace!("{num} events happened");
            self.fill_active_channels(num, active);
        } else if num == 0 {
            crate::trace!("nothing happened");
        } else if saved.kind() != io::ErrorKind::Interrupted {
            crate::error!("PollPoller::poll(): {saved}");
        }
        now
    }

    fn fill_active_channels(&self, mut num: i32, active: &mut Vec<Rc<Channel>>) {
        for pfd in &self.pollfds {
            if num <= 0 {
                break;
            }
            if pfd.revents > 0 {
                num -= 1;
                if let Some(channel) = self.channels.get(&pfd.fd) {
                    channel.set_revents(u32::from(pfd.revents as u16));
                    active.push(channel.clone());
                }
            }
        }
    }

    pub(crate) fn update_channel(&mut self, channel: &Rc<Channel>) {
        crate::trace!(
            "poll update fd = {} events = {}",
            channel.fd(),
            channel.events()
        );
        if channel.index() < 0 {
            // a new one, append to the array
            assert!(!self.channels.contains_key(&channel.fd()));
            self.pollfds.push(libc::pollfd {
                fd: channel.fd(),
                events: channel.events() as i16,
                revents: 0,
            });
            channel.set_index((self.pollfds.len() - 1) as i32);
            _ = self.channels.insert(channel.fd(), channel.clone());
        } else {
            // update an existing one
            assert!(self.channels.contains_key(&channel.fd()));
            let idx = channel.index() as usize;
            assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            assert!(pfd.fd == channel.fd() || pfd.fd == -channel.fd() - 1);
            pfd.fd = channel.fd();
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            if channel.is_none_event() {
                pfd.fd = -channel.fd() - 1;
            }
        }
    }

    pub(crate) fn remove_channel(&mut self, channel: &Rc<Channel>) {
        crate::trace!("poll remove fd = {}", channel.fd());
        assert!(channel.is_none_event());
        let idx = channel.index() as usize;
        assert!(idx < self.pollfds.len());
        _ = self.channels.remove(&channel.fd());
        let last = self.pollfds.len() - 1;
        if idx != last {
            // swap-remove; the moved slot's channel learns its new index
            let mut moved_fd = self.pollfds[last].fd;
            self.pollfds.swap(idx, last);
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(idx as i32);
            }
        }
        _ = self.pollfds.pop();
        channel.set_index(INDEX_NEW);
    }

    pub(crate) fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.channels
            .get(&channel.fd())
            .map_or(false, |c| Rc::ptr_eq(c, channel))
    }
}

impl fmt::Debug for PollPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollPoller")
            .field("fds", &self.pollfds.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}
