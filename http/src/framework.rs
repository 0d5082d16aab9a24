//! User-facing framework facade: route registration, dispatch, default
//! error handlers and the run loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use reactor_net::{Error, EventLoop, ServerOptions};

use crate::context::Context;
use crate::metrics::HANDLER_ERRORS;
use crate::request::{HttpRequest, Method};
use crate::response::{HttpResponse, StatusCode};
use crate::router::{Handler, RouteResult, Router, RouterError};
use crate::server::HttpServer;

/// Failure reported by a handler; the message becomes the error response
/// body.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> HandlerError {
        HandlerError {
            message: message.into(),
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError { message }
    }
}

/// Infallible handler for the 404/405 paths.
pub type FallbackHandler = Arc<dyn Fn(&mut Context) + Send + Sync>;
/// Global error handler; receives the failure message.
pub type ErrorHandler = Arc<dyn Fn(&mut Context, &str) + Send + Sync>;

fn default_not_found(ctx: &mut Context) {
    let resp = ctx.response();
    resp.set_status(StatusCode::NotFound);
    resp.set_body("404 Not Found");
    resp.set_close_connection(true);
}

fn default_method_not_allowed(ctx: &mut Context) {
    let resp = ctx.response();
    resp.set_status(StatusCode::MethodNotAllowed);
    resp.set_body("405 Method Not Allowed");
    resp.set_close_connection(true);
}

fn default_error_handler(ctx: &mut Context, message: &str) {
    let resp = ctx.response();
    resp.set_status(StatusCode::InternalServerError);
    resp.set_body(format!("Internal Server Error: {message}"));
    resp.set_close_connection(true);
}

/// The web framework: owns the base loop, the HTTP server, the router and
/// the configurable fallback/error handlers.
///
/// Construct on the thread that will run it (the base loop binds to its
/// creating thread), register routes, then [`run`](Framework::run).
pub struct Framework {
    base_loop: Arc<EventLoop>,
    server: HttpServer,
    router: Router,
    not_found: FallbackHandler,
    method_not_allowed: FallbackHandler,
    error_handler: ErrorHandler,
}

impl Framework {
    pub fn new(
        listen_addr: SocketAddr,
        name: &str,
        options: ServerOptions,
    ) -> Result<Framework, Error> {
        let base_loop = EventLoop::new()?;
        let server = HttpServer::new(base_loop.clone(), listen_addr, name, options)?;
        Ok(Framework {
            base_loop,
            server,
            router: Router::new(),
            not_found: Arc::new(default_not_found),
            method_not_allowed: Arc::new(default_method_not_allowed),
            error_handler: Arc::new(default_error_handler),
        })
    }

    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn get(
        &mut self,
        path: &str,
        handler: impl Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Result<(), RouterError> {
        self.router.add_route(path, Method::Get, Arc::new(handler))
    }

    pub fn post(
        &mut self,
        path: &str,
        handler: impl Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Result<(), RouterError> {
        self.router.add_route(path, Method::Post, Arc::new(handler))
    }

    pub fn put(
        &mut self,
        path: &str,
        handler: impl Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Result<(), RouterError> {
        self.router.add_route(path, Method::Put, Arc::new(handler))
    }

    pub fn delete(
        &mut self,
        path: &str,
        handler: impl Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Result<(), RouterError> {
        self.router.add_route(path, Method::Delete, Arc::new(handler))
    }

    pub fn head(
        &mut self,
        path: &str,
        handler: impl Fn(&mut Context) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Result<(), RouterError> {
        self.router.add_route(path, Method::Head, Arc::new(handler))
    }

    pub fn set_not_found_handler(&mut self, handler: FallbackHandler) {
        self.not_found = handler;
    }

    pub fn set_method_not_allowed_handler(&mut self, handler: FallbackHandler) {
        self.method_not_allowed = handler;
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    /// Freeze the router, start the server and run the base loop. Blocks
    /// until the loop quits.
    pub fn run(self) -> Result<(), Error> {
        let router = Arc::new(self.router);
        let not_found = self.not_found;
        let method_not_allowed = self.method_not_allowed;
        let error_handler = self.error_handler;

        self.server
            .set_http_callback(Arc::new(move |req, resp| {
                dispatch(
                    &router,
                    &not_found,
                    &method_not_allowed,
                    &error_handler,
                    req,
                    resp,
                );
            }));
        self.server.start()?;
        self.base_loop.run();
        Ok(())
    }
}

/// Route one request to its handler (or a fallback) and absorb handler
/// failures at this boundary: an `Err` return and a panic both reach the
/// error handler.
fn dispatch(
    router: &Router,
    not_found: &FallbackHandler,
    method_not_allowed: &FallbackHandler,
    error_handler: &ErrorHandler,
    req: &HttpRequest,
    resp: &mut HttpResponse,
) {
    match router.find_route(req.path(), req.method()) {
        RouteResult::Found { handler, params } => {
            let mut ctx = Context::new(req, resp, params);
            run_guarded(&handler, error_handler, &mut ctx);
        }
        RouteResult::NotFoundMethod => {
            let mut ctx = Context::new(req, resp, HashMap::new());
            method_not_allowed(&mut ctx);
        }
        RouteResult::NotFoundUrl => {
            let mut ctx = Context::new(req, resp, HashMap::new());
            not_found(&mut ctx);
        }
    }
}

fn run_guarded(handler: &Handler, error_handler: &ErrorHandler, ctx: &mut Context) {
    let outcome = catch_unwind(AssertUnwindSafe(|| handler(ctx)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            HANDLER_ERRORS.increment();
            tracing::warn!(error = %e, "handler failed");
            error_handler(ctx, &e.to_string());
        }
        Err(panic) => {
            HANDLER_ERRORS.increment();
            let message = panic_message(&panic);
            tracing::error!(reason = message, "handler panicked");
            error_handler(ctx, message);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "handler panicked"
    }
}
