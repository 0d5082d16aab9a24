//! Connected-socket lifecycle: buffered reads, queued writes, graceful
//! shutdown ordering and the idle timer.
//!
//! A `TcpConnection` is shared-owned (`Arc`): the server's connection map
//! holds the authoritative reference, callbacks extend the lifetime
//! transiently, and the channel holds only a weak tie that is upgraded for
//! the duration of one event dispatch. All state transitions happen on the
//! connection's IO loop thread; cross-thread calls trampoline through
//! `run_in_loop`.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::{Buffer, ReadResult};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT};
use crate::socket::Socket;
use crate::timer::TimerId;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Connection state machine.
///
/// ```text
/// Connecting ── connect_established ──> Connected
/// Connected  ── remote close / error ──> Disconnected
/// Connected  ── shutdown() ──> Disconnecting ── output drained ──> Disconnected
/// Connected/Disconnecting ── force_close() ──> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    io_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    idle_timeout: Duration,
    high_water_mark: usize,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    /// Slot for a protocol decoder (e.g. the HTTP parse context).
    context: Mutex<Option<Box<dyn Any + Send>>>,
    idle_timer: Mutex<Option<TimerId>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

/// Fallback connection-change callback: log the transition.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    tracing::info!(
        name = conn.name(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection state change"
    );
}

/// Fallback message callback: discard, so unread input cannot pile up.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _when: Instant) {
    buf.retrieve_all();
}

impl TcpConnection {
    pub(crate) fn new(
        io_loop: Arc<EventLoop>,
        name: String,
        fd: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        idle_timeout: Duration,
        high_water_mark: usize,
    ) -> Arc<TcpConnection> {
        let socket = Socket::from_owned(fd);
        if let Err(e) = socket.set_keepalive(true) {
            tracing::warn!(name = %name, error = %e, "SO_KEEPALIVE failed");
        }

        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Channel::new(Arc::downgrade(&io_loop), socket.as_raw_fd());
            channel.set_edge_triggered(true);

            let w = weak.clone();
            channel.set_read_callback(Box::new(move |t| {
                if let Some(c) = w.upgrade() {
                    c.handle_read(t);
                }
            }));
            let w = weak.clone();
            channel.set_write_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_write();
                }
            }));
            let w = weak.clone();
            channel.set_close_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_close();
                }
            }));
            let w = weak.clone();
            channel.set_error_callback(Box::new(move || {
                if let Some(c) = w.upgrade() {
                    c.handle_error();
                }
            }));

            TcpConnection {
                self_weak: weak.clone(),
                io_loop,
                name,
                state: AtomicU8::new(ConnState::Connecting as u8),
                socket,
                channel,
                local_addr,
                peer_addr,
                idle_timeout,
                high_water_mark,
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                context: Mutex::new(None),
                idle_timer: Mutex::new(None),
                connection_cb: Mutex::new(None),
                message_cb: Mutex::new(None),
                write_complete_cb: Mutex::new(None),
                high_water_cb: Mutex::new(None),
                close_cb: Mutex::new(None),
            }
        });
        tracing::debug!(
            name = conn.name(),
            fd = conn.socket.as_raw_fd(),
            "connection created"
        );
        conn
    }

    /// The strong handle; valid as long as one `Arc` exists, which is the
    /// case on every path that can reach a method of this type.
    fn strong(&self) -> Arc<TcpConnection> {
        self.self_weak
            .upgrade()
            .expect("TcpConnection used after all strong references dropped")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.io_loop
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_cb.lock() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock() = Some(cb);
    }

    /// Store a per-connection context object (protocol parse state).
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock() = Some(Box::new(value));
    }

    pub fn clear_context(&self) {
        *self.context.lock() = None;
    }

    /// Run `f` against the stored context, if one of type `T` is present.
    pub fn with_context_mut<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.context.lock();
        slot.as_mut()
            .and_then(|boxed| boxed.downcast_mut::<T>())
            .map(f)
    }

    /// Finish establishment on the IO loop: tie the channel to this
    /// connection, start watching for reads, arm the idle timer and fire
    /// the upward connection-change callback.
    pub(crate) fn connect_established(&self) {
        self.io_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        let tie: Arc<dyn Any + Send + Sync> = self.strong();
        self.channel.tie(Arc::downgrade(&tie));
        self.channel.enable_reading();

        if let Some(cb) = self.connection_cb.lock().clone() {
            cb(&self.strong());
        }
        self.extend_lifetime();
    }

    /// Final teardown, run by the IO loop after the server dropped its map
    /// reference. Cancels the idle timer (which holds a strong reference;
    /// leaving it armed would keep the connection alive) and retires the
    /// channel.
    pub(crate) fn connect_destroyed(&self) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_cb.lock().clone() {
                cb(&self.strong());
            }
        }
        if let Some(id) = self.idle_timer.lock().take() {
            self.io_loop.cancel(id);
        }
        self.channel.remove();
        tracing::debug!(name = self.name(), "connection destroyed");
    }

    /// Queue `data` for delivery. Callable from any thread; off-thread
    /// callers pay one copy for the trampoline. Dropped unless the state is
    /// `Connected`.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.io_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.strong();
            let data = data.to_vec();
            self.io_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            tracing::warn!(name = self.name(), "disconnected, dropping send");
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        // Fast path: nothing queued and the channel is not watching for
        // writability, so ordering cannot be violated by writing directly.
        if !self.channel.is_writing() && self.output.lock().readable_bytes() == 0 {
            self.extend_lifetime();
            while written < data.len() {
                let n = unsafe {
                    libc::write(
                        self.socket.as_raw_fd(),
                        data[written..].as_ptr() as *const libc::c_void,
                        data.len() - written,
                    )
                };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::Interrupted => continue,
                        io::ErrorKind::WouldBlock => break,
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                            tracing::error!(name = self.name(), error = %err, "send failed");
                            fault = true;
                            break;
                        }
                        _ => {
                            tracing::error!(name = self.name(), error = %err, "send failed");
                            break;
                        }
                    }
                }
                written += n as usize;
            }
            BYTES_SENT.add(written as u64);

            if !fault && written == data.len() {
                if let Some(cb) = self.write_complete_cb.lock().clone() {
                    let conn = self.strong();
                    self.io_loop.queue_in_loop(Box::new(move || cb(&conn)));
                }
                return;
            }
        }

        // Remainder goes through the output buffer and the writable event.
        if !fault && written < data.len() {
            let remaining = &data[written..];
            let mut output = self.output.lock();
            let old_len = output.readable_bytes();

            if old_len + remaining.len() >= self.high_water_mark && old_len < self.high_water_mark
            {
                if let Some(cb) = self.high_water_cb.lock().clone() {
                    let conn = self.strong();
                    let size = old_len + remaining.len();
                    self.io_loop
                        .queue_in_loop(Box::new(move || cb(&conn, size)));
                }
            }

            output.append(remaining);
            drop(output);

            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close once the queued output drains. Never blocks and never
    /// races in-flight writes: if the channel is still watching for
    /// writability, the drain path performs the close instead.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.strong();
            self.io_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.io_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Unconditional close, scheduled on the IO loop.
    pub fn force_close(&self) {
        match self.state() {
            ConnState::Connected | ConnState::Disconnecting => {
                self.set_state(ConnState::Disconnecting);
                let conn = self.strong();
                self.io_loop.queue_in_loop(Box::new(move || {
                    if matches!(
                        conn.state(),
                        ConnState::Connected | ConnState::Disconnecting
                    ) {
                        conn.handle_close();
                    }
                }));
            }
            _ => {}
        }
    }

    /// Cancel the previous idle timer and arm a fresh one. The timer
    /// callback holds a strong reference; expiry force-closes.
    fn extend_lifetime(&self) {
        let mut slot = self.idle_timer.lock();
        if let Some(id) = slot.take() {
            self.io_loop.cancel(id);
        }
        let conn = self.strong();
        *slot = Some(self.io_loop.run_after(self.idle_timeout, move || {
            tracing::info!(name = conn.name(), "idle timeout, force closing");
            conn.force_close();
        }));
    }

    fn handle_read(&self, receive_time: Instant) {
        self.io_loop.assert_in_loop_thread();
        let result = {
            let mut input = self.input.lock();
            input.read_fd(self.socket.as_raw_fd())
        };
        match result {
            Ok(ReadResult::Read(0)) => {}
            Ok(ReadResult::Read(n)) => {
                BYTES_RECEIVED.add(n as u64);
                self.extend_lifetime();
                let cb = self.message_cb.lock().clone();
                let mut input = self.input.lock();
                match cb {
                    Some(cb) => cb(&self.strong(), &mut *input, receive_time),
                    None => input.retrieve_all(),
                }
            }
            Ok(ReadResult::Eof) => {
                tracing::debug!(name = self.name(), "peer closed");
                self.handle_close();
            }
            Err(e) => {
                tracing::error!(name = self.name(), error = %e, "read failed");
                self.handle_close();
            }
        }
    }

    fn handle_write(&self) {
        self.io_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            tracing::debug!(name = self.name(), "connection is down, no more writing");
            return;
        }
        self.extend_lifetime();

        let (result, drained) = {
            let mut output = self.output.lock();
            let result = output.write_fd(self.socket.as_raw_fd());
            let drained = output.readable_bytes() == 0;
            (result, drained)
        };
        match result {
            Ok(n) => {
                BYTES_SENT.add(n as u64);
                if drained {
                    // Stop watching writability to avoid busy wake-ups.
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_cb.lock().clone() {
                        let conn = self.strong();
                        self.io_loop.queue_in_loop(Box::new(move || cb(&conn)));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
                // Not drained: EAGAIN; keep the interest and wait for the
                // next writable event.
            }
            Err(e) => {
                tracing::error!(name = self.name(), error = %e, "write failed");
            }
        }
    }

    fn handle_close(&self) {
        self.io_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            return;
        }
        tracing::info!(name = self.name(), "connection closing");
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        let guard = self.strong();
        if let Some(cb) = self.connection_cb.lock().clone() {
            cb(&guard);
        }
        if let Some(id) = self.idle_timer.lock().take() {
            self.io_loop.cancel(id);
        }
        // Internal callback, registered by the server: remove this
        // connection from the registry.
        if let Some(cb) = self.close_cb.lock().clone() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(e)) => e,
            Ok(None) => io::Error::other("unknown socket error"),
            Err(e) => e,
        };
        tracing::error!(name = self.name(), error = %err, "connection error");
        self.handle_close();
    }
}
