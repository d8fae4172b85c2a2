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

//! H1 parser implementation

use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::{Regex, RegexBuilder};

use crate::{Method, ParseError, Version};

pub mod request;
pub mod response;

use request::Request;

/// `(GET|HEAD|POST|PUT|DELETE) <path>[?<query>] HTTP/1.[01]`, matched against
/// the whole line, method case-insensitive, trailing CRLF or LF tolerated.
fn request_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"^(GET|HEAD|POST|PUT|DELETE) ([^?]*)(?:\?(.*))? (HTTP/1\.[01])(?:\r?\n)?$")
            .case_insensitive(true)
            .build()
            .expect("request line pattern must compile")
    })
}

/// Percent-decodes `input` per RFC 3986. With `plus_as_space` (query-string
/// convention) `+` decodes to a space before the escape pass, so a literal
/// plus still arrives as `%2B`.
///
/// Returns `None` when the decoded bytes are not valid UTF-8.
pub fn url_decode(input: &str, plus_as_space: bool) -> Option<String> {
    if plus_as_space && input.contains('+') {
        let replaced = input.replace('+', " ");
        percent_decode_str(&replaced)
            .decode_utf8()
            .ok()
            .map(|s| s.into_owned())
    } else {
        percent_decode_str(input)
            .decode_utf8()
            .ok()
            .map(|s| s.into_owned())
    }
}

/// Parses one request line into `req`: method, percent-decoded path, query
/// parameters (split on `&`, then on the first `=`, both halves decoded with
/// `+` as space) and version.
///
/// # Example
/// ```
/// # use parser::h1::{parse_request_line, request::Request};
/// # use parser::Method;
/// let mut req = Request::new();
/// parse_request_line("GET /search?q=a+b HTTP/1.1\r\n", &mut req).unwrap();
/// assert_eq!(Method::Get, req.method);
/// assert_eq!("/search", req.path);
/// assert_eq!(Some("a b"), req.param("q"));
/// ```
pub fn parse_request_line(line: &str, req: &mut Request) -> Result<(), ParseError> {
    let caps = request_line_re()
        .captures(line)
        .ok_or(ParseError::RequestLine)?;

    req.method = Method::parse(&caps[1]).ok_or(ParseError::Method)?;

    let path = url_decode(&caps[2], false).ok_or(ParseError::Target)?;
    if path.is_empty() {
        return Err(ParseError::Target);
    }
    req.path = path;

    req.version = Version::parse(&caps[4]).ok_or(ParseError::Version)?;

    if let Some(query) = caps.get(3) {
        // One trailing `&` is tolerated; empty pairs anywhere else are not.
        let query = query.as_str();
        let query = query.strip_suffix('&').unwrap_or(query);
        if !query.is_empty() {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').ok_or(ParseError::Query)?;
                let key = url_decode(key, true).ok_or(ParseError::Query)?;
                let value = url_decode(value, true).ok_or(ParseError::Query)?;
                req.set_param(key, value);
            }
        }
    }

    Ok(())
}

/// Splits one header line on the first `": "`. Key and value are kept
/// verbatim, no case folding; the trailing line break is stripped.
pub fn parse_header_line(line: &str) -> Result<(&str, &str), ParseError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    line.split_once(": ").ok_or(ParseError::Header)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_line_parses_method_path_version() {
        let mut req = Request::new();
        parse_request_line("GET /index.html HTTP/1.1\r\n", &mut req).unwrap();
        assert_eq!(Method::Get, req.method);
        assert_eq!("/index.html", req.path);
        assert_eq!(Version::H1_1, req.version);
    }

    #[test]
    fn request_line_accepts_lowercase_method() {
        let mut req = Request::new();
        parse_request_line("post /submit HTTP/1.0\n", &mut req).unwrap();
        assert_eq!(Method::Post, req.method);
        assert_eq!(Version::H1_0, req.version);
    }

    #[test]
    fn request_line_decodes_percent_escapes_in_path() {
        let mut req = Request::new();
        parse_request_line("GET /a%20b/c HTTP/1.1\r\n", &mut req).unwrap();
        assert_eq!("/a b/c", req.path);
    }

    #[test]
    fn request_line_splits_and_decodes_query() {
        let mut req = Request::new();
        parse_request_line("GET /s?q=a+b&lang=en%2Dus HTTP/1.1\r\n", &mut req).unwrap();
        assert_eq!("/s", req.path);
        assert_eq!(Some("a b"), req.param("q"));
        assert_eq!(Some("en-us"), req.param("lang"));
    }

    #[test]
    fn request_line_tolerates_a_trailing_ampersand() {
        let mut req = Request::new();
        parse_request_line("GET /s?a=1& HTTP/1.1\r\n", &mut req).unwrap();
        assert_eq!(Some("1"), req.param("a"));
        let mut req = Request::new();
        parse_request_line("GET /s? HTTP/1.1\r\n", &mut req).unwrap();
        assert_eq!("/s", req.path);
    }

    #[test]
    fn request_line_rejects_query_pair_without_equals() {
        let mut req = Request::new();
        let err = parse_request_line("GET /s?broken HTTP/1.1\r\n", &mut req);
        assert_eq!(Err(ParseError::Query), err);
    }

    #[test]
    fn request_line_rejects_unknown_method() {
        let mut req = Request::new();
        let err = parse_request_line("OPTIONS / HTTP/1.1\r\n", &mut req);
        assert_eq!(Err(ParseError::RequestLine), err);
    }

    #[test]
    fn request_line_rejects_http2() {
        let mut req = Request::new();
        let err = parse_request_line("GET / HTTP/2\r\n", &mut req);
        assert_eq!(Err(ParseError::RequestLine), err);
    }

    #[test]
    fn request_line_rejects_missing_version() {
        let mut req = Request::new();
        let err = parse_request_line("GET /\r\n", &mut req);
        assert_eq!(Err(ParseError::RequestLine), err);
    }

    #[test]
    fn header_line_splits_on_first_separator() {
        assert_eq!(
            Ok(("Host", "example.com")),
            parse_header_line("Host: example.com\r\n")
        );
        assert_eq!(
            Ok(("X-Note", "a: b: c")),
            parse_header_line("X-Note: a: b: c\n")
        );
    }

    #[test]
    fn header_line_keeps_key_case_verbatim() {
        assert_eq!(
            Ok(("content-length", "10")),
            parse_header_line("content-length: 10\r\n")
        );
    }

    #[test]
    fn header_line_without_separator_is_an_error() {
        assert_eq!(Err(ParseError::Header), parse_header_line("garbage\r\n"));
    }

    #[test]
    fn url_decode_plus_is_space_only_in_query_mode() {
        assert_eq!(Some("a b".to_string()), url_decode("a+b", true));
        assert_eq!(Some("a+b".to_string()), url_decode("a+b", false));
        assert_eq!(Some("a+b".to_string()), url_decode("a%2Bb", true));
    }

    #[test]
    fn url_decode_rejects_invalid_utf8() {
        assert_eq!(None, url_decode("%ff%fe", false));
    }
}
