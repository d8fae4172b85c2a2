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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! HTTP/1.1 request/response model and parser.
//!
//! This crate is pure data and parsing: the request and response models, the
//! request-line and header-line grammar, query-string handling and response
//! serialization. It performs no I/O; the server crate feeds it bytes as they
//! arrive off the wire.

use std::fmt::Display;

pub mod h1;
pub mod status;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    #[default]
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
}

impl Method {
    /// Parses a method token, case-insensitively.
    pub fn parse(token: &str) -> Option<Method> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("HEAD") {
            Some(Method::Head)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else if token.eq_ignore_ascii_case("PUT") {
            Some(Method::Put)
        } else if token.eq_ignore_ascii_case("DELETE") {
            Some(Method::Delete)
        } else {
            None
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// Representation of the requested HTTP version
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    #[default]
    H1_1,
}

impl Version {
    /// Parses a version token as it appears on the request line.
    pub fn parse(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::H1_0),
            "HTTP/1.1" => Some(Version::H1_1),
            _ => None,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Represents possible failures while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Request line does not match the grammar.
    RequestLine,
    /// Invalid or unsupported method.
    Method,
    /// Invalid request target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Malformed header line.
    Header,
    /// Malformed query string.
    Query,
    /// Malformed Content-Length value.
    ContentLength,
}

impl ParseError {
    fn description_str(self) -> &'static str {
        match self {
            ParseError::RequestLine => "Malformed request line",
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid request target",
            ParseError::Version => "Invalid version",
            ParseError::Header => "Malformed header line",
            ParseError::Query => "Malformed query string",
            ParseError::ContentLength => "Malformed Content-Length",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

#[cfg(test)]
mod test {
    use super::{Method, Version};

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!(Some(Method::Get), Method::parse("GET"));
        assert_eq!(Some(Method::Get), Method::parse("get"));
        assert_eq!(Some(Method::Delete), Method::parse("DeLeTe"));
        assert_eq!(None, Method::parse("OPTIONS"));
        assert_eq!(None, Method::parse(""));
    }

    #[test]
    fn version_parses_exact_tokens_only() {
        assert_eq!(Some(Version::H1_0), Version::parse("HTTP/1.0"));
        assert_eq!(Some(Version::H1_1), Version::parse("HTTP/1.1"));
        assert_eq!(None, Version::parse("HTTP/2"));
        assert_eq!(None, Version::parse("http/1.1"));
    }

    #[test]
    fn method_displays_as_wire_token() {
        assert_eq!("HEAD", Method::Head.to_string());
        assert_eq!("HTTP/1.1", Version::H1_1.to_string());
    }
}
