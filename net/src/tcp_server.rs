//! TCP server: acceptor + IO loop pool + live-connection registry.
//!
//! New connections are created on the base loop, assigned to an IO loop by
//! round-robin, and finish establishment there. The registry holds the
//! authoritative `Arc` for each connection; removal trampolines back to the
//! base loop and final destruction is queued on the owning IO loop.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::loop_thread::EventLoopThreadPool;
use crate::metrics::CONNECTIONS_ACTIVE;
use crate::socket;

/// Tunables for a server instance.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Set `SO_REUSEPORT` on the listener so multiple server instances can
    /// bind the same port.
    pub reuse_port: bool,
    /// Number of IO loop threads; zero hosts all connections on the base
    /// loop.
    pub threads: usize,
    /// Idle window after which a silent connection is force-closed.
    pub idle_timeout: Duration,
    /// Output-buffer size that triggers the high-water callback.
    pub high_water_mark: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            reuse_port: false,
            threads: 0,
            idle_timeout: Duration::from_secs(60),
            high_water_mark: 64 * 1024 * 1024,
        }
    }
}

pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    base_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: EventLoopThreadPool,
    connections: Mutex<AHashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    idle_timeout: Duration,
    high_water_mark: usize,
    connection_cb: Mutex<ConnectionCallback>,
    message_cb: Mutex<MessageCallback>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
}

impl TcpServer {
    pub fn new(
        base_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        options: ServerOptions,
    ) -> Result<Arc<TcpServer>, Error> {
        let acceptor = Acceptor::new(base_loop.clone(), listen_addr, options.reuse_port)?;
        let ip_port = acceptor.local_addr().to_string();
        let pool = EventLoopThreadPool::new(base_loop.clone(), options.threads, name);

        let server = Arc::new_cyclic(|weak: &Weak<TcpServer>| TcpServer {
            self_weak: weak.clone(),
            base_loop,
            name: name.to_string(),
            ip_port,
            acceptor,
            pool,
            connections: Mutex::new(AHashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            idle_timeout: options.idle_timeout,
            high_water_mark: options.high_water_mark,
            connection_cb: Mutex::new(Arc::new(default_connection_callback)),
            message_cb: Mutex::new(Arc::new(default_message_callback)),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer_addr);
                }
            }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn base_loop(&self) -> &Arc<EventLoop> {
        &self.base_loop
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_cb.lock() = Some(cb);
    }

    /// Start the IO pool and begin listening. Idempotent.
    pub fn start(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.start()?;
        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || acceptor.listen());
        tracing::info!(name = %self.name, addr = %self.ip_port, "server started");
        Ok(())
    }

    /// Runs on the base loop for every accepted socket.
    fn new_connection(&self, fd: OwnedFd, peer_addr: SocketAddr) {
        self.base_loop.assert_in_loop_thread();

        let io_loop = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);

        let local_addr = match socket::local_addr_of(&fd) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "getsockname failed, dropping connection");
                return;
            }
        };

        tracing::info!(
            server = %self.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );

        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            fd,
            local_addr,
            peer_addr,
            self.idle_timeout,
            self.high_water_mark,
        );

        conn.set_connection_callback(self.connection_cb.lock().clone());
        conn.set_message_callback(self.message_cb.lock().clone());
        if let Some(cb) = self.write_complete_cb.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_cb.lock().clone() {
            conn.set_high_water_mark_callback(cb);
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(c);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        CONNECTIONS_ACTIVE.increment();

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Invoked from a connection's close path, possibly on an IO loop;
    /// registry mutation belongs to the base loop.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let server = self
            .self_weak
            .upgrade()
            .expect("TcpServer used after all strong references dropped");
        let conn = conn.clone();
        self.base_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.base_loop.assert_in_loop_thread();
        tracing::info!(server = %self.name, conn = conn.name(), "removing connection");

        if self.connections.lock().remove(conn.name()).is_some() {
            CONNECTIONS_ACTIVE.decrement();
        }

        // Final destruction must happen on the owning IO loop, after the
        // registry reference is gone.
        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));
    }

    /// Number of live connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}
