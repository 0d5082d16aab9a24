//! Reactor HTTP server.
//!
//! Configuration loading and logging initialization for the
//! `reactor-server` binary; the runtime lives in `reactor-net` and the
//! HTTP layer in `reactor-http`.

pub mod config;
pub mod logging;

pub use config::Config;
