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

//! Response model

use crate::status::reason_phrase;

/// A response under construction: status code, headers in insertion order,
/// body bytes and an optional redirect target.
#[derive(Debug)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    /// Response body bytes.
    pub body: Vec<u8>,
    redirect: Option<String>,
}

impl Response {
    /// Creates an empty response with the given status code.
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            redirect: None,
        }
    }

    /// The status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Replaces the status code.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Sets a header, replacing an existing one with the same key.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    /// Looks up a header by its exact key.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header with this exact key has been set.
    pub fn has_header(&self, key: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == key)
    }

    /// Sets the body and its `Content-Type` in one step.
    pub fn set_content(&mut self, body: impl Into<Vec<u8>>, content_type: &str) {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
    }

    /// Turns the response into a redirect to `url`.
    pub fn set_redirect(&mut self, url: impl Into<String>, status: u16) {
        self.status = status;
        self.redirect = Some(url.into());
    }

    /// The redirect target, when one was set.
    pub fn redirect_url(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    /// Serializes the response with its framing headers decided.
    ///
    /// Layout: `HTTP/1.1 <code> <reason>\r\n`, then `Connection` (per
    /// `close`), then `Content-Length` (always present, even for an empty
    /// body), then `Location` for redirects, then the remaining headers in
    /// insertion order, then a defaulted `Content-Type:
    /// application/octet-stream` when a body is present without one, a blank
    /// line, and the body.
    pub fn serialize(&self, close: bool) -> Vec<u8> {
        let mut head = String::with_capacity(128);
        head.push_str("HTTP/1.1 ");
        head.push_str(&self.status.to_string());
        head.push(' ');
        head.push_str(reason_phrase(self.status));
        head.push_str("\r\n");

        head.push_str("Connection: ");
        head.push_str(if close { "close" } else { "keep-alive" });
        head.push_str("\r\n");

        head.push_str("Content-Length: ");
        head.push_str(&self.body.len().to_string());
        head.push_str("\r\n");

        if let Some(url) = &self.redirect {
            head.push_str("Location: ");
            head.push_str(url);
            head.push_str("\r\n");
        }

        for (key, value) in &self.headers {
            if key == "Connection" || key == "Content-Length" || key == "Location" {
                continue;
            }
            head.push_str(key);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }

        if !self.body.is_empty() && !self.has_header("Content-Type") {
            head.push_str("Content-Type: application/octet-stream\r\n");
        }

        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new(200)
    }
}

#[cfg(test)]
mod test {
    use super::Response;

    #[test]
    fn serialize_emits_framing_in_fixed_order() {
        let mut resp = Response::new(200);
        resp.set_content(&b"{\"msg\":\"login ok\"}"[..], "application/json");
        let bytes = resp.serialize(false);
        assert_eq!(
            "HTTP/1.1 200 OK\r\n\
             Connection: keep-alive\r\n\
             Content-Length: 18\r\n\
             Content-Type: application/json\r\n\
             \r\n\
             {\"msg\":\"login ok\"}",
            String::from_utf8(bytes).unwrap()
        );
    }

    #[test]
    fn serialize_always_sets_content_length() {
        let resp = Response::new(204);
        let text = String::from_utf8(resp.serialize(true)).unwrap();
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn serialize_defaults_content_type_for_nonempty_body() {
        let mut resp = Response::new(200);
        resp.body = b"raw".to_vec();
        let text = String::from_utf8(resp.serialize(false)).unwrap();
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
    }

    #[test]
    fn serialize_omits_content_type_for_empty_body() {
        let resp = Response::new(200);
        let text = String::from_utf8(resp.serialize(false)).unwrap();
        assert!(!text.contains("Content-Type"));
    }

    #[test]
    fn serialize_adds_location_for_redirects() {
        let mut resp = Response::new(200);
        resp.set_redirect("/new", 302);
        let text = String::from_utf8(resp.serialize(true)).unwrap();
        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(text.contains("Location: /new\r\n"));
    }

    #[test]
    fn set_header_replaces_existing_key() {
        let mut resp = Response::new(200);
        resp.set_header("X-Tag", "a");
        resp.set_header("X-Tag", "b");
        assert_eq!(Some("b"), resp.header("X-Tag"));
        let text = String::from_utf8(resp.serialize(true)).unwrap();
        assert_eq!(1, text.matches("X-Tag").count());
    }

    #[test]
    fn unknown_status_gets_unknown_reason() {
        let resp = Response::new(299);
        let text = String::from_utf8(resp.serialize(true)).unwrap();
        assert!(text.starts_with("HTTP/1.1 299 Unknown\r\n"));
    }
}
