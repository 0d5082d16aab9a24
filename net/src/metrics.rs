//! Runtime metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read from sockets")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to sockets")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Total timer expirations dispatched")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(name = "timers_cancelled", description = "Total timers cancelled")]
pub static TIMERS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "accept_errors",
    description = "Accept failures other than EAGAIN"
)]
pub static ACCEPT_ERRORS: Counter = Counter::new();
