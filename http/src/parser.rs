//! Incremental request decoder.
//!
//! The parser operates on the connection's input buffer in place, and its
//! state persists across partial reads so fragmented TCP delivery and
//! keep-alive reuse are handled uniformly: feed it whatever arrived, check
//! [`HttpContext::is_complete`], dispatch, [`HttpContext::reset`], repeat.

use std::time::Instant;

use reactor_net::Buffer;

use crate::request::{HttpRequest, Method, Version};

/// Resumable position of the decoder within the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    ExpectRequestLine,
    ExpectHeaders,
    ExpectBody,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid request line")]
    BadRequestLine,
    #[error("unsupported method")]
    BadMethod,
    #[error("unsupported version")]
    BadVersion,
    #[error("invalid header line")]
    BadHeader,
    #[error("invalid Content-Length")]
    BadContentLength,
}

/// Per-connection parse context: the state machine plus the request being
/// assembled.
pub struct HttpContext {
    state: ParseState,
    request: HttpRequest,
    content_length: usize,
    plus_as_space: bool,
}

impl Default for HttpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpContext {
    pub fn new() -> HttpContext {
        HttpContext {
            state: ParseState::ExpectRequestLine,
            request: HttpRequest::new(),
            content_length: 0,
            plus_as_space: false,
        }
    }

    /// Decode `+` as space in query strings.
    pub fn set_plus_as_space(&mut self, on: bool) {
        self.plus_as_space = on;
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// The assembled request; consistent and immutable once
    /// [`is_complete`](Self::is_complete) holds, until `reset`.
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Re-prime for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::ExpectRequestLine;
        self.request = HttpRequest::new();
        self.content_length = 0;
    }

    /// Consume as much of `buf` as the current state allows. Returns `Ok`
    /// both on progress and on "need more bytes"; a protocol violation
    /// returns the error and leaves the context poisoned until `reset`.
    pub fn parse(&mut self, buf: &mut Buffer, receive_time: Instant) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::ExpectRequestLine => {
                    let Some(pos) = buf.find_crlf() else {
                        return Ok(());
                    };
                    {
                        let line = &buf.readable()[..pos];
                        self.process_request_line(line)?;
                    }
                    self.request.set_receive_time(receive_time);
                    buf.retrieve(pos + 2);
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let Some(pos) = buf.find_crlf() else {
                        return Ok(());
                    };
                    if pos == 0 {
                        // Bare CRLF terminates the header block.
                        buf.retrieve(2);
                        self.content_length = self.parse_content_length()?;
                        self.state = if self.content_length > 0 {
                            ParseState::ExpectBody
                        } else {
                            ParseState::Complete
                        };
                    } else {
                        {
                            let line = &buf.readable()[..pos];
                            self.process_header_line(line)?;
                        }
                        buf.retrieve(pos + 2);
                    }
                }
                ParseState::ExpectBody => {
                    if buf.readable_bytes() < self.content_length {
                        // Short: wait for the next read cycle.
                        return Ok(());
                    }
                    {
                        let body = &buf.readable()[..self.content_length];
                        self.request.set_body(body);
                    }
                    buf.retrieve(self.content_length);
                    self.state = ParseState::Complete;
                }
                ParseState::Complete => return Ok(()),
            }
        }
    }

    /// `METHOD SP URL SP VERSION`; URL splits on the first `?` into the
    /// literal path and the query string.
    fn process_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().ok_or(ParseError::BadRequestLine)?;
        let target = parts.next().ok_or(ParseError::BadRequestLine)?;
        let version = parts.next().ok_or(ParseError::BadRequestLine)?;

        let method = Method::parse(method).ok_or(ParseError::BadMethod)?;
        self.request.set_method(method);

        match version {
            "HTTP/1.1" => self.request.set_version(Version::Http11),
            "HTTP/1.0" => self.request.set_version(Version::Http10),
            _ => return Err(ParseError::BadVersion),
        }

        if target.is_empty() {
            return Err(ParseError::BadRequestLine);
        }
        match target.find('?') {
            Some(pos) => {
                self.request.set_path(&target[..pos]);
                self.request
                    .set_query_string(&target[pos + 1..], self.plus_as_space);
            }
            None => self.request.set_path(target),
        }
        Ok(())
    }

    /// `FIELD ":" OWS VALUE OWS`. Whitespace in (or instead of) the field
    /// name is rejected; trailing value whitespace is stripped.
    fn process_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
        let colon = line.find(':').ok_or(ParseError::BadHeader)?;
        let field = &line[..colon];
        if field.is_empty() || field.contains(|c: char| c == ' ' || c == '\t') {
            return Err(ParseError::BadHeader);
        }
        let value = line[colon + 1..].trim_matches(|c: char| c == ' ' || c == '\t');
        self.request.add_header(field, value);
        Ok(())
    }

    /// Absence of `Content-Length` means a zero-byte body.
    fn parse_content_length(&self) -> Result<usize, ParseError> {
        match self.request.header("Content-Length") {
            Some(raw) => raw.trim().parse().map_err(|_| ParseError::BadContentLength),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ctx: &mut HttpContext, bytes: &[u8]) -> Result<(), ParseError> {
        let mut buf = Buffer::new();
        buf.append(bytes);
        ctx.parse(&mut buf, Instant::now())
    }

    #[test]
    fn test_simple_get() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(ctx.is_complete());

        let req = ctx.request();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.body().is_empty());
    }

    #[test]
    fn test_query_string_split() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"GET /search?q=rust&page=2 HTTP/1.1\r\n\r\n").unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.request().path(), "/search");
        assert_eq!(ctx.request().query("q"), Some("rust"));
        assert_eq!(ctx.request().query("page"), Some("2"));
    }

    #[test]
    fn test_query_plus_decodes_to_space_when_enabled() {
        let mut ctx = HttpContext::new();
        ctx.set_plus_as_space(true);
        feed(&mut ctx, b"GET /search?q=a+b+c&raw=x%2By HTTP/1.1\r\n\r\n").unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.request().query("q"), Some("a b c"));
        assert_eq!(ctx.request().query("raw"), Some("x+y"));

        // Without the option the plus stays literal.
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"GET /search?q=a+b HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(ctx.request().query("q"), Some("a+b"));
    }

    #[test]
    fn test_fragmented_delivery_resumes() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";

        for chunk in raw.chunks(3) {
            assert!(!ctx.is_complete());
            buf.append(chunk);
            ctx.parse(&mut buf, Instant::now()).unwrap();
        }
        assert!(ctx.is_complete());
        assert_eq!(ctx.request().method(), Method::Post);
        assert_eq!(ctx.request().body(), b"body");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_body_waits_for_content_length_bytes() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.append(b"PUT /x HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345");
        ctx.parse(&mut buf, Instant::now()).unwrap();
        assert_eq!(ctx.state(), ParseState::ExpectBody);

        buf.append(b"67890GARBAGE");
        ctx.parse(&mut buf, Instant::now()).unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.request().body(), b"1234567890");
        // Pipelined remainder stays in the buffer.
        assert_eq!(buf.readable(), b"GARBAGE");
    }

    #[test]
    fn test_reset_allows_next_request() {
        let mut ctx = HttpContext::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        ctx.parse(&mut buf, Instant::now()).unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.request().path(), "/a");

        ctx.reset();
        ctx.parse(&mut buf, Instant::now()).unwrap();
        assert!(ctx.is_complete());
        assert_eq!(ctx.request().path(), "/b");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unsupported_method_rejected() {
        let mut ctx = HttpContext::new();
        assert_eq!(
            feed(&mut ctx, b"PATCH /x HTTP/1.1\r\n\r\n"),
            Err(ParseError::BadMethod)
        );
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut ctx = HttpContext::new();
        assert_eq!(
            feed(&mut ctx, b"GET /x HTTP/2.0\r\n\r\n"),
            Err(ParseError::BadVersion)
        );
    }

    #[test]
    fn test_header_field_whitespace_rejected() {
        let mut ctx = HttpContext::new();
        assert_eq!(
            feed(&mut ctx, b"GET / HTTP/1.1\r\nBad Header: x\r\n\r\n"),
            Err(ParseError::BadHeader)
        );
    }

    #[test]
    fn test_header_value_whitespace_stripped() {
        let mut ctx = HttpContext::new();
        feed(&mut ctx, b"GET / HTTP/1.1\r\nHost:   spaced.example   \r\n\r\n").unwrap();
        assert_eq!(ctx.request().header("Host"), Some("spaced.example"));
    }

    #[test]
    fn test_malformed_content_length_rejected() {
        let mut ctx = HttpContext::new();
        assert_eq!(
            feed(&mut ctx, b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"),
            Err(ParseError::BadContentLength)
        );
    }
}
