//! Glue between the TCP runtime and the HTTP layer.
//!
//! Installs a parse context on every connection, drives the parser from
//! the message callback (looping so back-to-back requests in one read are
//! all served), applies the keep-alive policy and serializes responses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use reactor_net::{Buffer, Error, EventLoop, ServerOptions, TcpConnection, TcpServer};

use crate::metrics::{PARSE_ERRORS, REQUESTS};
use crate::parser::HttpContext;
use crate::request::{HttpRequest, Version};
use crate::response::{HttpResponse, StatusCode};

/// Invoked once per complete request to fill in the response.
pub type HttpCallback = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

fn default_http_callback(_req: &HttpRequest, resp: &mut HttpResponse) {
    resp.set_status(StatusCode::NotFound);
    resp.set_close_connection(true);
}

pub struct HttpServer {
    server: Arc<TcpServer>,
    http_cb: Arc<Mutex<HttpCallback>>,
}

impl HttpServer {
    pub fn new(
        base_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        options: ServerOptions,
    ) -> Result<HttpServer, Error> {
        let server = TcpServer::new(base_loop, listen_addr, name, options)?;
        let http_cb: Arc<Mutex<HttpCallback>> =
            Arc::new(Mutex::new(Arc::new(default_http_callback)));

        // Every connection gets its own parse context, installed on the
        // upward transition and torn down with the connection.
        server.set_connection_callback(Arc::new(|conn: &Arc<TcpConnection>| {
            if conn.connected() {
                tracing::info!(peer = %conn.peer_addr(), "connection up");
                let mut ctx = HttpContext::new();
                // Query strings use form-style encoding where `+` is a space.
                ctx.set_plus_as_space(true);
                conn.set_context(ctx);
            } else {
                tracing::info!(peer = %conn.peer_addr(), "connection down");
            }
        }));

        let cb_slot = http_cb.clone();
        server.set_message_callback(Arc::new(
            move |conn: &Arc<TcpConnection>, buf: &mut Buffer, receive_time: Instant| {
                let http_cb = cb_slot.lock().clone();
                Self::on_message(conn, buf, receive_time, &http_cb);
            },
        ));

        Ok(HttpServer { server, http_cb })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }

    /// Set the request callback. Must happen before `start`.
    pub fn set_http_callback(&self, cb: HttpCallback) {
        *self.http_cb.lock() = cb;
    }

    pub fn start(&self) -> Result<(), Error> {
        tracing::info!(
            name = self.server.name(),
            addr = self.server.ip_port(),
            "http server starts listening"
        );
        self.server.start()
    }

    fn on_message(
        conn: &Arc<TcpConnection>,
        buf: &mut Buffer,
        receive_time: Instant,
        http_cb: &HttpCallback,
    ) {
        conn.with_context_mut::<HttpContext, _>(|ctx| loop {
            if let Err(e) = ctx.parse(buf, receive_time) {
                PARSE_ERRORS.increment();
                tracing::warn!(peer = %conn.peer_addr(), error = %e, "bad request");
                conn.send(b"HTTP/1.1 400 Bad Request\r\n\r\n");
                conn.shutdown();
                return;
            }
            if !ctx.is_complete() {
                // Partial request: the buffer keeps what arrived, the
                // context keeps its state, the next read resumes.
                return;
            }
            Self::on_request(conn, ctx.request(), http_cb);
            // Re-prime for the next request on this keep-alive connection,
            // then loop: the read may have carried several requests.
            ctx.reset();
        });
    }

    /// Keep-alive policy: HTTP/1.1 defaults to keep-alive, HTTP/1.0 to
    /// close; an explicit `Connection` header wins either way.
    fn on_request(conn: &Arc<TcpConnection>, req: &HttpRequest, http_cb: &HttpCallback) {
        REQUESTS.increment();

        let connection_hdr = req.header("Connection").unwrap_or("");
        let close = connection_hdr.eq_ignore_ascii_case("close")
            || (req.version() == Version::Http10
                && !connection_hdr.eq_ignore_ascii_case("keep-alive"));

        let mut response = HttpResponse::new(close);
        http_cb(req, &mut response);

        let mut out = Buffer::new();
        response.append_to_buffer(&mut out);
        conn.send(out.readable());

        // shutdown() waits for the output buffer to drain before the
        // half-close.
        if response.close_connection() {
            conn.shutdown();
        }
    }
}
