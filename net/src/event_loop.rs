//! One-loop-per-thread event dispatcher.
//!
//! The loop binds to the thread that constructs it and every operation that
//! touches the poller or the channel set must run on that thread; a
//! mismatched call is a programming error and panics. Other threads submit
//! work through [`EventLoop::run_in_loop`] / [`EventLoop::queue_in_loop`],
//! which append a closure to the deferred queue and poke an eventfd so the
//! blocked `epoll_wait` returns promptly.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Error;
use crate::poller::Poller;
use crate::timer::{TimerId, TimerQueue};

pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<EventLoop>> = const { RefCell::new(Weak::new()) };
}

fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub struct EventLoop {
    self_weak: Weak<EventLoop>,
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    wakeup_fd: OwnedFd,
    wakeup_channel: Arc<Channel>,
    timers: TimerQueue,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    looping: AtomicBool,
    quit: AtomicBool,
}

impl EventLoop {
    /// Create a loop bound to the current thread. At most one live loop per
    /// thread; a second construction panics.
    pub fn new() -> Result<Arc<EventLoop>, Error> {
        let already = LOOP_IN_THIS_THREAD.with(|slot| slot.borrow().upgrade().is_some());
        if already {
            panic!("another EventLoop already exists in this thread");
        }

        let poller = Poller::new()?;
        let wakeup_fd = create_eventfd()?;
        let timer_fd = TimerQueue::create_timerfd()?;

        let lp = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak.clone(), wakeup_fd.as_raw_fd());
            let timers = TimerQueue::new(weak.clone(), timer_fd);
            EventLoop {
                self_weak: weak.clone(),
                thread_id: thread::current().id(),
                poller: Mutex::new(poller),
                wakeup_fd,
                wakeup_channel,
                timers,
                pending: Mutex::new(Vec::new()),
                calling_pending: AtomicBool::new(false),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
            }
        });

        // Register the wakeup channel: reading drains the eventfd counter so
        // a level-triggered poller does not spin.
        let weak = Arc::downgrade(&lp);
        lp.wakeup_channel.set_read_callback(Box::new(move |_| {
            if let Some(lp) = weak.upgrade() {
                lp.handle_wakeup_read();
            }
        }));
        lp.wakeup_channel.enable_reading();

        lp.timers.install(&lp);

        LOOP_IN_THIS_THREAD.with(|slot| *slot.borrow_mut() = Arc::downgrade(&lp));
        tracing::debug!(thread = ?lp.thread_id, "event loop created");
        Ok(lp)
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    #[inline]
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by {:?} accessed from {:?}",
                self.thread_id,
                thread::current().id()
            );
        }
    }

    /// The strong handle for this loop; valid while any `Arc` is alive.
    fn strong(&self) -> Arc<EventLoop> {
        self.self_weak
            .upgrade()
            .expect("EventLoop used after all strong references dropped")
    }

    /// Run the dispatch loop on the owning thread until [`quit`](Self::quit).
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);
        tracing::info!("event loop start");

        while !self.quit.load(Ordering::Acquire) {
            let ready = match self.poller.lock().poll() {
                Ok(ready) => ready,
                // Demultiplexer failure is loop-fatal.
                Err(e) => panic!("epoll_wait failed: {e}"),
            };
            let receive_time = Instant::now();

            for channel in &ready {
                channel.handle_event(receive_time);
            }

            // Deferred closures run after the dispatch pass so they observe
            // a consistent channel set.
            self.do_pending_tasks();
        }

        tracing::info!("event loop stop");
        self.looping.store(false, Ordering::Release);
    }

    /// True while `run` is executing.
    pub fn is_running(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Ask the loop to exit at the top of its next iteration.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: immediately and synchronously when the
    /// caller is already on it, otherwise via the deferred queue.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(Box::new(task));
        }
    }

    /// Append a task to the deferred queue.
    ///
    /// The wakeup fires when the caller is off-thread, or when the loop is
    /// currently draining deferred tasks: a task enqueued from inside the
    /// drain must make the next wait return immediately instead of blocking
    /// until unrelated IO arrives.
    pub fn queue_in_loop(&self, task: Task) {
        {
            self.pending.lock().push(task);
        }
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // Swap under the mutex, execute unlocked: bounds lock hold time and
        // lets a task enqueue further tasks without deadlock.
        let tasks = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        loop {
            let n = unsafe {
                libc::write(
                    self.wakeup_fd.as_raw_fd(),
                    &one as *const u64 as *const libc::c_void,
                    8,
                )
            };
            if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            if n != 8 {
                tracing::error!(
                    written = n,
                    error = %io::Error::last_os_error(),
                    "eventfd wakeup write failed"
                );
            }
            return;
        }
    }

    /// Drain the eventfd counter so the level-triggered wait does not keep
    /// firing.
    fn handle_wakeup_read(&self) {
        let mut counter: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.wakeup_fd.as_raw_fd(),
                    &mut counter as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if err.kind() != io::ErrorKind::WouldBlock {
                    tracing::error!(error = %err, "eventfd drain failed");
                }
            } else if n != 8 {
                tracing::error!(read = n, "eventfd drain read {} bytes instead of 8", n);
            }
            return;
        }
    }

    /// Run `cb` once at `when`.
    pub fn run_at(&self, when: Instant, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timers.add_timer(&self.strong(), Arc::new(cb), when, None)
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timers
            .add_timer(&self.strong(), Arc::new(cb), Instant::now() + delay, None)
    }

    /// Run `cb` every `interval`, first firing one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.timers.add_timer(
            &self.strong(),
            Arc::new(cb),
            Instant::now() + interval,
            Some(interval),
        )
    }

    /// Cancel a timer. Safe to call from any thread and from inside a timer
    /// callback (including the timer's own).
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(&self.strong(), id);
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(e) = self.poller.lock().update_channel(channel) {
            // An ADD/MOD failure leaves the channel set inconsistent.
            panic!("epoll_ctl add/mod failed for fd {}: {e}", channel.fd());
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }
}
