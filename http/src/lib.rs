//! HTTP/1.1 layer over the reactor runtime.
//!
//! An incremental, restartable request parser feeds a prefix-tree router
//! with path-parameter and wildcard support; the [`Framework`] facade wires
//! both onto [`reactor_net::TcpServer`] and exposes route registration plus
//! configurable not-found / method-not-allowed / error handlers.

pub mod context;
pub mod framework;
pub mod metrics;
pub mod parser;
pub mod percent;
pub mod request;
pub mod response;
pub mod router;
pub mod server;

pub use context::Context;
pub use framework::{ErrorHandler, FallbackHandler, Framework, HandlerError};
pub use parser::{HttpContext, ParseError, ParseState};
pub use request::{HttpRequest, Method, Version};
pub use response::{HttpResponse, StatusCode};
pub use router::{Handler, PathParams, RouteResult, Router, RouterError};
pub use server::{HttpCallback, HttpServer};
