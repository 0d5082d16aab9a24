//! HTTP layer metrics.

use metriken::{metric, Counter};

#[metric(name = "http_requests", description = "Complete requests dispatched")]
pub static REQUESTS: Counter = Counter::new();

#[metric(
    name = "http_parse_errors",
    description = "Requests rejected with 400 Bad Request"
)]
pub static PARSE_ERRORS: Counter = Counter::new();

#[metric(
    name = "http_handler_errors",
    description = "Handler failures routed to the error handler"
)]
pub static HANDLER_ERRORS: Counter = Counter::new();
