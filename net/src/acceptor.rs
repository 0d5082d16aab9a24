//! Listening socket and its accept loop.
//!
//! The listening channel is level-triggered: accept storms are bounded by
//! the kernel backlog, and LT recovers more simply from a transient
//! `EMFILE`. One idle fd is reserved at startup; when `accept` hits the
//! descriptor limit, the idle fd is closed, the surplus connection is
//! accepted and immediately dropped to drain the backlog entry, and the
//! idle fd is reopened.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics::{ACCEPT_ERRORS, CONNECTIONS_ACCEPTED};
use crate::socket::Socket;

const LISTEN_BACKLOG: i32 = 4096;

pub type NewConnectionCallback = Box<dyn Fn(OwnedFd, SocketAddr) + Send>;

pub struct Acceptor {
    base_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    listening: AtomicBool,
    idle_fd: Mutex<Option<OwnedFd>>,
    on_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Bind `addr` immediately (so the effective address is queryable);
    /// `listen()` is deferred to server start.
    pub fn new(
        base_loop: Arc<EventLoop>,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let socket = Socket::bind_listener(addr, reuse_port)?;
        let local_addr = socket.local_addr()?;
        let idle_fd = OwnedFd::from(File::open("/dev/null")?);

        let acceptor = Arc::new_cyclic(|weak: &Weak<Acceptor>| {
            let channel = Channel::new(Arc::downgrade(&base_loop), socket.as_raw_fd());
            let w = weak.clone();
            channel.set_read_callback(Box::new(move |_| {
                if let Some(acceptor) = w.upgrade() {
                    acceptor.handle_read();
                }
            }));
            Acceptor {
                base_loop,
                socket,
                channel,
                local_addr,
                listening: AtomicBool::new(false),
                idle_fd: Mutex::new(Some(idle_fd)),
                on_connection: Mutex::new(None),
            }
        });
        tracing::info!(addr = %acceptor.local_addr, "acceptor bound");
        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_connection.lock() = Some(cb);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Start listening. Must run on the base loop.
    pub fn listen(&self) {
        self.base_loop.assert_in_loop_thread();
        if let Err(e) = self.socket.listen(LISTEN_BACKLOG) {
            panic!("listen on {} failed: {e}", self.local_addr);
        }
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        tracing::info!(addr = %self.local_addr, "acceptor listening");
    }

    fn handle_read(&self) {
        self.base_loop.assert_in_loop_thread();

        loop {
            match self.socket.accept() {
                Ok((fd, peer_addr)) => {
                    CONNECTIONS_ACCEPTED.increment();
                    let guard = self.on_connection.lock();
                    match &*guard {
                        Some(cb) => cb(fd, peer_addr),
                        // No consumer: close right away instead of leaking.
                        None => drop(fd),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    ACCEPT_ERRORS.increment();
                    tracing::error!(addr = %self.local_addr, "accept: process fd limit reached");
                    self.drain_over_limit();
                    break;
                }
                Err(e) => {
                    ACCEPT_ERRORS.increment();
                    tracing::error!(addr = %self.local_addr, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// The reserved-idle-fd trick: free a descriptor, pull the surplus
    /// connection out of the backlog, drop it, re-reserve.
    fn drain_over_limit(&self) {
        let mut slot = self.idle_fd.lock();

        // Free one descriptor so the accept below can succeed.
        drop(slot.take());

        // Pull the pending connection out of the kernel queue and refuse it;
        // otherwise the level-triggered poller spins on the readable
        // listener forever.
        let fd = unsafe {
            libc::accept(
                self.socket.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }

        // Re-reserve for the next incident.
        match File::open("/dev/null") {
            Ok(f) => *slot = Some(OwnedFd::from(f)),
            Err(e) => tracing::error!(error = %e, "failed to re-reserve idle fd"),
        }
    }
}
