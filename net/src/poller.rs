//! Epoll-backed IO demultiplexer.
//!
//! Keeps the fd-to-channel map and reconciles each channel's interest mask
//! against the kernel via the three-tag transition table:
//!
//! | tag       | interest  | action | new tag   |
//! |-----------|-----------|--------|-----------|
//! | `New`     | any       | ADD    | `Added`   |
//! | `Deleted` | any       | ADD    | `Added`   |
//! | `Added`   | empty     | DEL    | `Deleted` |
//! | `Added`   | non-empty | MOD    | `Added`   |
//!
//! Channels with empty interest are only logically deleted: the dispatch
//! pass holds the channels it returned from `poll`, and a reinstatement
//! later in the same pass must rebind the same channel object, not a fresh
//! one with an identical fd.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use ahash::AHashMap;

use crate::channel::{Channel, PollTag};

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct Poller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: AHashMap<RawFd, Arc<Channel>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: AHashMap::new(),
        })
    }

    /// Block until at least one channel is ready, write the ready masks back
    /// into the channels, and return them. `EINTR` is retried.
    pub fn poll(&mut self) -> io::Result<Vec<Arc<Channel>>> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let n = n as usize;
            let mut ready = Vec::with_capacity(n);
            for i in 0..n {
                let event = self.events[i];
                let fd = event.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(event.events);
                    ready.push(channel.clone());
                }
            }

            // A full return may mean truncation; double the buffer.
            if n == self.events.len() {
                self.events
                    .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
            }

            return Ok(ready);
        }
    }

    /// Reconcile the kernel interest state for this channel. ADD/MOD
    /// failures propagate (loop-fatal); DEL failures are tolerated.
    pub fn update_channel(&mut self, channel: &Arc<Channel>) -> io::Result<()> {
        let fd = channel.fd();
        match channel.tag() {
            PollTag::New | PollTag::Deleted => {
                if channel.tag() == PollTag::New {
                    if self.channels.contains_key(&fd) {
                        tracing::error!(fd, "new channel already present in poller map");
                    }
                    self.channels.insert(fd, channel.clone());
                } else {
                    // Logically deleted: still in the map, bound to the same
                    // channel object.
                    match self.channels.get(&fd) {
                        Some(existing) if Arc::ptr_eq(existing, channel) => {}
                        _ => tracing::error!(fd, "deleted channel not bound in poller map"),
                    }
                }
                channel.set_tag(PollTag::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel)
            }
            PollTag::Added => {
                if channel.is_none_event() {
                    let _ = self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_tag(PollTag::Deleted);
                    Ok(())
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel)
                }
            }
        }
    }

    /// Remove a channel from the map (and the kernel, if still added).
    pub fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        match self.channels.get(&fd) {
            Some(existing) if Arc::ptr_eq(existing, channel) => {}
            Some(_) => {
                tracing::error!(fd, "remove_channel: channel mismatch");
                return;
            }
            None => {
                tracing::error!(fd, "remove_channel: fd not found");
                return;
            }
        }
        if !channel.is_none_event() {
            tracing::error!(fd, "remove_channel: channel still has interest");
        }

        self.channels.remove(&fd);
        if channel.tag() == PollTag::Added {
            let _ = self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_tag(PollTag::New);
    }

    fn ctl(&self, op: libc::c_int, channel: &Arc<Channel>) -> io::Result<()> {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.epoll_interest(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                // The connection may have closed the fd already.
                tracing::warn!(fd, error = %err, "epoll_ctl DEL failed");
                Ok(())
            } else {
                Err(err)
            }
        } else {
            Ok(())
        }
    }
}
