//! Parsed request representation.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::percent::url_decode;

/// Supported request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
}

impl Method {
    /// Parse a method token; anything outside the supported set is a parse
    /// failure upstream.
    pub fn parse(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "HEAD" => Some(Method::Head),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    Http10,
    Http11,
}

/// A decoded (possibly in-progress) HTTP request.
///
/// Header storage preserves the first-seen field casing; lookups compare
/// case-insensitively.
#[derive(Debug, Default)]
pub struct HttpRequest {
    method: Option<Method>,
    version: Version,
    path: String,
    queries: HashMap<String, String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    receive_time: Option<Instant>,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest::default()
    }

    pub fn method(&self) -> Method {
        self.method.expect("method queried before request line parsed")
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = Some(method);
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Resource path, retained literally (no decoding, no prefix stripping).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    pub fn queries(&self) -> &HashMap<String, String> {
        &self.queries
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.queries.get(key).map(String::as_str)
    }

    /// Parse an `&`-separated `key[=value]` query string. Empty entries are
    /// skipped; both sides are percent-decoded.
    pub(crate) fn set_query_string(&mut self, raw: &str, plus_as_space: bool) {
        for entry in raw.split('&') {
            if entry.is_empty() {
                continue;
            }
            let (key, value) = match entry.find('=') {
                Some(pos) => (&entry[..pos], &entry[pos + 1..]),
                None => (entry, ""),
            };
            self.queries.insert(
                url_decode(key, plus_as_space),
                url_decode(value, plus_as_space),
            );
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, field: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn add_header(&mut self, field: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
        {
            Some(slot) => slot.1 = value.to_string(),
            None => self.headers.push((field.to_string(), value.to_string())),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn set_body(&mut self, body: &[u8]) {
        self.body = body.to_vec();
    }

    pub fn receive_time(&self) -> Option<Instant> {
        self.receive_time
    }

    pub(crate) fn set_receive_time(&mut self, t: Instant) {
        self.receive_time = Some(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_tokens() {
        assert_eq!(Method::parse("GET"), Some(Method::Get));
        assert_eq!(Method::parse("DELETE"), Some(Method::Delete));
        assert_eq!(Method::parse("get"), None);
        assert_eq!(Method::parse("PATCH"), None);
    }

    #[test]
    fn test_query_string_parsing() {
        let mut req = HttpRequest::new();
        req.set_query_string("name=tom&flag&x=%2F&empty=", false);
        assert_eq!(req.query("name"), Some("tom"));
        assert_eq!(req.query("flag"), Some(""));
        assert_eq!(req.query("x"), Some("/"));
        assert_eq!(req.query("empty"), Some(""));
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn test_header_lookup_case_insensitive_first_casing_kept() {
        let mut req = HttpRequest::new();
        req.add_header("Content-Length", "10");
        req.add_header("CONTENT-LENGTH", "20");
        assert_eq!(req.header("content-length"), Some("20"));
        assert_eq!(req.headers().len(), 1);
        assert_eq!(req.headers()[0].0, "Content-Length");
    }
}
