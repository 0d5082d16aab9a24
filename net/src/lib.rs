//! Non-blocking TCP networking runtime.
//!
//! A reactor-style runtime built directly on epoll: each [`EventLoop`] owns
//! one OS thread, one epoll instance, an eventfd for cross-thread wakeup and
//! a timerfd-backed timer queue. Connections are distributed across a pool
//! of IO loops by an acceptor running on the base loop.
//!
//! The pieces compose bottom-up: a [`Channel`] binds a file descriptor to a
//! loop, the poller multiplexes channels, [`TcpConnection`] drives buffered
//! reads/writes over its channel, and [`TcpServer`] ties the acceptor, the
//! loop pool and the connection set together.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod loop_thread;
pub mod metrics;
pub mod tcp_server;
pub mod timer;

mod poller;
mod socket;

pub use buffer::{Buffer, ReadResult};
pub use channel::Channel;
pub use connection::{
    ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::EventLoop;
pub use loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use tcp_server::{ServerOptions, TcpServer};
pub use timer::TimerId;
