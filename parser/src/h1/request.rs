// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 Request

use std::collections::HashMap;

use crate::{Method, ParseError, Version};

/// A parsed (or partially parsed) request: method, decoded path, version,
/// headers, query parameters, body, and the capture groups of whichever route
/// pattern matched it.
#[derive(Debug, Default)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Percent-decoded request path, without the query string.
    pub path: String,
    /// Protocol version from the request line.
    pub version: Version,
    /// Request body bytes.
    pub body: Vec<u8>,
    /// Capture groups of the route pattern that matched `path`. Index 0 is
    /// the whole match.
    pub captures: Vec<String>,
    headers: HashMap<String, String>,
    params: HashMap<String, String>,
}

impl Request {
    /// Creates an empty request.
    pub fn new() -> Request {
        Request::default()
    }

    /// Restores the request to its freshly-constructed state.
    pub fn reset(&mut self) {
        self.method = Method::default();
        self.path.clear();
        self.version = Version::default();
        self.body.clear();
        self.captures.clear();
        self.headers.clear();
        self.params.clear();
    }

    /// Stores a header. Keys are case-sensitive; a repeated key overwrites.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Looks up a header by its exact key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Whether a header with this exact key was received.
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    /// Stores a query-string parameter.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Looks up a query-string parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The declared body length. A missing `Content-Length` means zero.
    pub fn content_length(&self) -> Result<usize, ParseError> {
        match self.header("Content-Length") {
            None => Ok(0),
            Some(v) => v.trim().parse().map_err(|_| ParseError::ContentLength),
        }
    }

    /// Whether the connection should close once this request is answered.
    ///
    /// HTTP/1.1 stays open unless the client sent `Connection: close`;
    /// HTTP/1.0 closes unless the client sent `Connection: keep-alive`.
    /// Header values compare case-insensitively.
    pub fn wants_close(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => true,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
            _ => self.version == Version::H1_0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Request;
    use crate::{ParseError, Version};

    #[test]
    fn headers_are_case_sensitive() {
        let mut req = Request::new();
        req.set_header("Host", "a");
        assert_eq!(Some("a"), req.header("Host"));
        assert_eq!(None, req.header("host"));
        assert!(req.has_header("Host"));
        assert!(!req.has_header("HOST"));
    }

    #[test]
    fn content_length_defaults_to_zero() {
        let req = Request::new();
        assert_eq!(Ok(0), req.content_length());
    }

    #[test]
    fn content_length_parses_declared_value() {
        let mut req = Request::new();
        req.set_header("Content-Length", "42");
        assert_eq!(Ok(42), req.content_length());
    }

    #[test]
    fn content_length_rejects_garbage() {
        let mut req = Request::new();
        req.set_header("Content-Length", "4x");
        assert_eq!(Err(ParseError::ContentLength), req.content_length());
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        let mut req = Request::new();
        req.version = Version::H1_1;
        assert!(!req.wants_close());
        req.set_header("Connection", "close");
        assert!(req.wants_close());
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut req = Request::new();
        req.version = Version::H1_0;
        assert!(req.wants_close());
        req.set_header("Connection", "Keep-Alive");
        assert!(!req.wants_close());
    }

    #[test]
    fn reset_clears_all_accumulated_state() {
        let mut req = Request::new();
        req.path = "/x".into();
        req.body = b"abc".to_vec();
        req.set_header("Host", "a");
        req.set_param("q", "1");
        req.captures.push("/x".into());
        req.reset();
        assert!(req.path.is_empty());
        assert!(req.body.is_empty());
        assert!(req.captures.is_empty());
        assert!(!req.has_header("Host"));
        assert_eq!(None, req.param("q"));
    }
}
