//! Response builder and wire serialization.

use reactor_net::Buffer;

/// Status codes the framework emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    MovedPermanently,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::MovedPermanently => 301,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::InternalServerError => "Internal Server Error",
        }
    }
}

/// Response under construction by a handler.
pub struct HttpResponse {
    status: StatusCode,
    status_message: Option<String>,
    close_connection: bool,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    /// `close` carries the connection policy derived from the request;
    /// handlers may override it.
    pub fn new(close: bool) -> HttpResponse {
        HttpResponse {
            status: StatusCode::Ok,
            status_message: None,
            close_connection: close,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Override the canonical reason phrase.
    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    pub fn set_close_connection(&mut self, close: bool) {
        self.close_connection = close;
    }

    /// Set a header, replacing any case-insensitively equal field.
    pub fn set_header(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&field))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((field, value)),
        }
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize onto the wire.
    ///
    /// `Content-Length` and `Connection` are always written by the
    /// framework; user headers follow verbatim, then the blank line and
    /// the body.
    pub fn append_to_buffer(&self, out: &mut Buffer) {
        let reason = match &self.status_message {
            Some(custom) => custom.as_str(),
            None => self.status.reason(),
        };
        out.append(format!("HTTP/1.1 {} {}\r\n", self.status.code(), reason).as_bytes());
        out.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        if self.close_connection {
            out.append(b"Connection: close\r\n");
        } else {
            out.append(b"Connection: Keep-Alive\r\n");
        }
        for (field, value) in &self.headers {
            out.append(field.as_bytes());
            out.append(b": ");
            out.append(value.as_bytes());
            out.append(b"\r\n");
        }
        out.append(b"\r\n");
        out.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serialize(resp: &HttpResponse) -> String {
        let mut buf = Buffer::new();
        resp.append_to_buffer(&mut buf);
        buf.retrieve_all_as_string()
    }

    #[test]
    fn test_keep_alive_response() {
        let mut resp = HttpResponse::new(false);
        resp.set_status(StatusCode::Ok);
        resp.set_body("hi");
        let wire = serialize(&resp);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Length: 2\r\n"));
        assert!(wire.contains("Connection: Keep-Alive\r\n"));
        assert!(wire.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn test_close_response_still_carries_length() {
        let mut resp = HttpResponse::new(true);
        resp.set_status(StatusCode::NotFound);
        resp.set_body("404 Not Found");
        let wire = serialize(&resp);
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Connection: close\r\n"));
        assert!(wire.contains("Content-Length: 13\r\n"));
    }

    #[test]
    fn test_custom_headers_and_message() {
        let mut resp = HttpResponse::new(false);
        resp.set_status_message("Fine");
        resp.set_content_type("application/json");
        resp.set_header("content-type", "text/plain");
        resp.set_body("{}");
        let wire = serialize(&resp);
        assert!(wire.starts_with("HTTP/1.1 200 Fine\r\n"));
        // Case-insensitive replacement, first casing kept.
        assert!(wire.contains("Content-Type: text/plain\r\n"));
        assert!(!wire.contains("application/json"));
    }
}
