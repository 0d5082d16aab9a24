//! Hierarchical timer queue backed by a kernel timerfd.
//!
//! One timerfd per loop, armed to the earliest pending expiration. Pending
//! timers live in two structures that stay in lockstep: a time-ordered
//! `BTreeMap` keyed by `(expiration, sequence)` for expiration sweeps, and
//! a sequence-indexed map for cancellation. A cancel that lands while the
//! expired batch is being dispatched is recorded so the restart phase will
//! not reinstate the timer; the common case is a repeating timer's
//! callback cancelling itself.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{TIMERS_CANCELLED, TIMERS_FIRED};

/// Minimum arm delta, avoiding a pathological immediate-firing loop.
const MIN_ARM_DELTA: Duration = Duration::from_micros(100);

/// Process-wide sequence source, so a handle can never name a timer in a
/// different loop's queue.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle for cancelling a timer.
///
/// Sequences are allocated monotonically per queue and never reused, so the
/// handle stays valid (as a no-op) after the timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) u64);

struct TimerEntry {
    callback: TimerCallback,
    interval: Option<Duration>,
}

#[derive(Default)]
struct TimerInner {
    /// Time-ordered pending set.
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    /// Sequence index over the same entries, for cancellation.
    active: HashMap<u64, Instant>,
    /// True while expired callbacks are running.
    calling_expired: bool,
    /// Sequences cancelled while their entry sat in the expired batch.
    cancelled_in_dispatch: HashSet<u64>,
}

pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    channel: Arc<Channel>,
    inner: Mutex<TimerInner>,
}

impl TimerQueue {
    pub fn create_timerfd() -> io::Result<OwnedFd> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn new(owner_loop: Weak<EventLoop>, timer_fd: OwnedFd) -> TimerQueue {
        let channel = Channel::new(owner_loop, timer_fd.as_raw_fd());
        TimerQueue {
            timer_fd,
            channel,
            inner: Mutex::new(TimerInner::default()),
        }
    }

    /// Hook the timerfd channel into the loop. Called once right after the
    /// loop's `Arc` exists.
    pub fn install(&self, lp: &Arc<EventLoop>) {
        let weak = Arc::downgrade(lp);
        self.channel.set_read_callback(Box::new(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.timers().handle_expired(&lp);
            }
        }));
        self.channel.enable_reading();
    }

    /// Register `cb` to fire at `when` (repeating every `interval` when
    /// given). Thread safe: the insertion trampolines to the loop thread.
    pub fn add_timer(
        &self,
        lp: &Arc<EventLoop>,
        cb: TimerCallback,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(lp);
        lp.run_in_loop(move || {
            if let Some(lp) = weak.upgrade() {
                lp.timers().insert_entry(sequence, when, cb, interval);
            }
        });
        TimerId(sequence)
    }

    /// Cancel the timer named by `id`. A timer currently in the expired
    /// batch is marked so it will not be reinstated.
    pub fn cancel(&self, lp: &Arc<EventLoop>, id: TimerId) {
        let weak = Arc::downgrade(lp);
        lp.run_in_loop(move || {
            if let Some(lp) = weak.upgrade() {
                lp.timers().cancel_in_loop(id.0);
            }
        });
    }

    fn insert_entry(
        &self,
        sequence: u64,
        when: Instant,
        callback: TimerCallback,
        interval: Option<Duration>,
    ) {
        let earliest_changed = {
            let mut inner = self.inner.lock();
            let earliest_changed = match inner.timers.keys().next() {
                Some(first) => (when, sequence) < *first,
                None => true,
            };
            inner
                .timers
                .insert((when, sequence), TimerEntry { callback, interval });
            inner.active.insert(sequence, when);
            earliest_changed
        };
        if earliest_changed {
            self.arm(when);
        }
    }

    fn cancel_in_loop(&self, sequence: u64) {
        let mut inner = self.inner.lock();
        if let Some(when) = inner.active.remove(&sequence) {
            let removed = inner.timers.remove(&(when, sequence));
            debug_assert!(removed.is_some());
            TIMERS_CANCELLED.increment();
        } else if inner.calling_expired {
            // Already moved into the expired batch for this tick; make sure
            // the restart phase does not bring it back.
            inner.cancelled_in_dispatch.insert(sequence);
            TIMERS_CANCELLED.increment();
        }
    }

    /// Expiration dispatch, driven by the timerfd read callback.
    fn handle_expired(&self, lp: &Arc<EventLoop>) {
        lp.assert_in_loop_thread();
        self.drain_timerfd();
        let now = Instant::now();

        // Split the expired batch out of both structures.
        let expired: Vec<(u64, TimerCallback, Option<Duration>)> = {
            let mut inner = self.inner.lock();
            let remaining = inner.timers.split_off(&(now, u64::MAX));
            let expired_map = std::mem::replace(&mut inner.timers, remaining);
            for (_, sequence) in expired_map.keys() {
                inner.active.remove(sequence);
            }
            inner.calling_expired = true;
            inner.cancelled_in_dispatch.clear();
            expired_map
                .into_iter()
                .map(|((_, sequence), entry)| (sequence, entry.callback, entry.interval))
                .collect()
        };

        // Callbacks run with the lock released so they can add or cancel
        // timers freely.
        for (_, callback, _) in &expired {
            TIMERS_FIRED.increment();
            callback();
        }

        let mut inner = self.inner.lock();
        inner.calling_expired = false;
        for (sequence, callback, interval) in expired {
            if let Some(interval) = interval {
                if !inner.cancelled_in_dispatch.contains(&sequence) {
                    let when = now + interval;
                    inner.timers.insert(
                        (when, sequence),
                        TimerEntry {
                            callback,
                            interval: Some(interval),
                        },
                    );
                    inner.active.insert(sequence, when);
                }
            }
        }
        inner.cancelled_in_dispatch.clear();

        if let Some(((when, _), _)) = inner.timers.iter().next() {
            let when = *when;
            drop(inner);
            self.arm(when);
        }
    }

    /// Arm the timerfd for `when` (relative, clamped to the minimum delta).
    fn arm(&self, when: Instant) {
        let mut delta = when.saturating_duration_since(Instant::now());
        if delta < MIN_ARM_DELTA {
            delta = MIN_ARM_DELTA;
        }
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delta.as_secs() as libc::time_t,
                tv_nsec: delta.subsec_nanos() as libc::c_long,
            },
        };
        let rc = unsafe {
            libc::timerfd_settime(
                self.timer_fd.as_raw_fd(),
                0,
                &new_value,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            tracing::error!(error = %io::Error::last_os_error(), "timerfd_settime failed");
        }
    }

    /// Read and discard the expiration counter; the channel is
    /// level-triggered, so leaving it unread would re-fire forever.
    fn drain_timerfd(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            tracing::warn!(read = n, "timerfd read {} bytes instead of 8", n);
        }
    }
}
