//! Per-request handler context.

use crate::request::HttpRequest;
use crate::response::{HttpResponse, StatusCode};
use crate::router::PathParams;

/// What a handler sees: the parsed request, the response builder and the
/// path parameters captured by the router. The handler must fully populate
/// the response before returning.
pub struct Context<'a> {
    request: &'a HttpRequest,
    response: &'a mut HttpResponse,
    params: PathParams,
}

impl<'a> Context<'a> {
    pub fn new(request: &'a HttpRequest, response: &'a mut HttpResponse, params: PathParams) -> Self {
        Context {
            request,
            response,
            params,
        }
    }

    pub fn request(&self) -> &HttpRequest {
        self.request
    }

    pub fn response(&mut self) -> &mut HttpResponse {
        self.response
    }

    /// Captured path parameter: `/user/:id` → `path_param("id")`.
    pub fn path_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Query parameter: `?name=abc` → `query("name") == Some("abc")`.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.request.query(key)
    }

    pub fn header(&self, field: &str) -> Option<&str> {
        self.request.header(field)
    }

    pub fn set_header(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.response.set_header(field, value);
    }

    /// Respond with plain text.
    pub fn text(&mut self, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.response.set_status(status);
        self.response.set_content_type("text/plain");
        self.response.set_body(body);
    }

    /// Respond with a pre-serialized JSON string.
    pub fn json(&mut self, status: StatusCode, body: impl Into<Vec<u8>>) {
        self.response.set_status(status);
        self.response.set_content_type("application/json");
        self.response.set_body(body);
    }
}
