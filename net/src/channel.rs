//! Binding of one file descriptor to one event loop.
//!
//! A channel carries the fd's interest and ready masks plus the callbacks
//! the loop dispatches into. It never opens, closes or reads the fd; the
//! fd's owner (connection, acceptor, the loop's own wakeup/timer fds) does.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::event_loop::EventLoop;

pub(crate) const EVENT_READ: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

/// Registration state of a channel inside the poller.
///
/// `Deleted` is a logical delete: the fd is gone from the kernel interest
/// set but the channel stays in the poller map so a reinstatement later in
/// the same dispatch pass rebinds the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PollTag {
    New = 0,
    Added = 1,
    Deleted = 2,
}

pub type ReadCallback = Box<dyn Fn(Instant) + Send>;
pub type EventCallback = Box<dyn Fn() + Send>;

pub struct Channel {
    self_weak: Weak<Channel>,
    owner_loop: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU32,
    revents: AtomicU32,
    tag: AtomicU8,
    edge_triggered: AtomicBool,
    /// Weak hold on the owning object, upgraded for the duration of one
    /// event dispatch so the owner cannot be torn down mid-callback.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_cb: Mutex<Option<ReadCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
}

impl Channel {
    /// The channel borrows `fd`; its lifetime must stay within the owning
    /// loop's lifetime.
    pub fn new(owner_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak| Channel {
            self_weak: weak.clone(),
            owner_loop,
            fd,
            interest: AtomicU32::new(0),
            revents: AtomicU32::new(0),
            tag: AtomicU8::new(PollTag::New as u8),
            edge_triggered: AtomicBool::new(false),
            tie: Mutex::new(None),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Connection channels run edge-triggered; the listening, wakeup and
    /// timer fds stay level-triggered. Set before the first enable call.
    pub fn set_edge_triggered(&self, on: bool) {
        self.edge_triggered.store(on, Ordering::Relaxed);
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        *self.read_cb.lock() = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        *self.write_cb.lock() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        *self.error_cb.lock() = Some(cb);
    }

    /// Bind the lifetime guard. Done once, when the owning object finishes
    /// its setup (e.g. `TcpConnection::connect_established`).
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(owner);
    }

    #[inline]
    pub(crate) fn interest(&self) -> u32 {
        self.interest.load(Ordering::Acquire)
    }

    /// Interest mask as handed to the kernel (edge-triggered bit folded in).
    pub(crate) fn epoll_interest(&self) -> u32 {
        let mut events = self.interest();
        if self.edge_triggered.load(Ordering::Relaxed) {
            events |= libc::EPOLLET as u32;
        }
        events
    }

    #[inline]
    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest() & EVENT_WRITE != 0
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest() & EVENT_READ != 0
    }

    #[inline]
    pub(crate) fn is_none_event(&self) -> bool {
        self.interest() & (EVENT_READ | EVENT_WRITE) == 0
    }

    pub(crate) fn tag(&self) -> PollTag {
        match self.tag.load(Ordering::Acquire) {
            0 => PollTag::New,
            1 => PollTag::Added,
            _ => PollTag::Deleted,
        }
    }

    pub(crate) fn set_tag(&self, tag: PollTag) {
        self.tag.store(tag as u8, Ordering::Release);
    }

    pub fn enable_reading(&self) {
        self.interest.fetch_or(EVENT_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest.fetch_or(EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest.fetch_and(!EVENT_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    /// Reconcile the kernel interest state through the owning loop.
    fn update(&self) {
        let me = match self.self_weak.upgrade() {
            Some(me) => me,
            None => return,
        };
        if let Some(lp) = self.owner_loop.upgrade() {
            lp.update_channel(&me);
        }
    }

    /// Retire this channel from the poller. Interest must be empty.
    pub fn remove(&self) {
        let me = match self.self_weak.upgrade() {
            Some(me) => me,
            None => return,
        };
        if let Some(lp) = self.owner_loop.upgrade() {
            lp.remove_channel(&me);
        }
    }

    /// Single dispatch entry, called by the loop for each ready channel.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let tie = self.tie.lock().clone();
        match tie {
            Some(weak) => match weak.upgrade() {
                // The guard keeps the owner alive across the callbacks.
                Some(_guard) => self.handle_event_with_guard(receive_time),
                // Owner already destroyed: drop the event silently.
                None => {}
            },
            None => self.handle_event_with_guard(receive_time),
        }
    }

    /// Dispatch by ready mask.
    ///
    /// HUP without IN means the peer is fully gone and nothing readable
    /// remains, so the close callback runs and nothing else. HUP together
    /// with IN falls through to the read path, which drains the residue and
    /// discovers the close from `read() == 0`. RDHUP alone is treated as
    /// readable for the same reason.
    fn handle_event_with_guard(&self, receive_time: Instant) {
        let revents = self.revents.load(Ordering::Acquire);

        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            tracing::warn!(fd = self.fd, "channel hangup");
            if let Some(cb) = &*self.close_cb.lock() {
                cb();
            }
            return;
        }

        if revents & libc::EPOLLERR as u32 != 0 {
            tracing::warn!(fd = self.fd, "channel error event");
            if let Some(cb) = &*self.error_cb.lock() {
                cb();
            }
        }

        if revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32 != 0 {
            if let Some(cb) = &*self.read_cb.lock() {
                cb(receive_time);
            }
        }

        if revents & libc::EPOLLOUT as u32 != 0 {
            if let Some(cb) = &*self.write_cb.lock() {
                cb();
            }
        }
    }
}
