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

//! Incremental HTTP/1.1 receive state machine

use parser::h1::request::Request;
use parser::h1::{parse_header_line, parse_request_line};

use crate::buffer::Buffer;

/// Longest tolerated request or header line, and the cap on how many bytes
/// may accumulate while waiting for a newline.
const MAX_LINE: usize = 8192;

/// Receive progress of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Waiting for the request line.
    Line,
    /// Collecting header lines.
    Head,
    /// Collecting the declared body.
    Body,
    /// A full request is ready.
    Over,
    /// Parsing failed; the status code says how.
    Error,
}

/// Per-connection parser context: receive state, latched response status
/// and the request being accumulated. Lives in the connection's protocol
/// context slot between message callbacks.
#[derive(Debug)]
pub struct HttpContext {
    status: u16,
    state: RecvState,
    request: Request,
}

impl HttpContext {
    /// A fresh context, expecting a request line.
    pub fn new() -> HttpContext {
        HttpContext {
            status: 200,
            state: RecvState::Line,
            request: Request::new(),
        }
    }

    /// The latched response status; ≥ 400 after a parse failure.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Current receive state.
    pub fn state(&self) -> RecvState {
        self.state
    }

    /// The request accumulated so far.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable access, for routing to stash captures.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Restores the context for the next request on the connection.
    pub fn reset(&mut self) {
        self.status = 200;
        self.state = RecvState::Line;
        self.request.reset();
    }

    fn fail(&mut self, status: u16) {
        self.state = RecvState::Error;
        self.status = status;
    }

    /// Absorbs whatever `buf` holds. Each stage runs only when the state
    /// has reached it, so one delivery can carry a request through all
    /// three stages or leave it parked mid-stage awaiting more bytes.
    pub fn recv(&mut self, buf: &mut Buffer) {
        if self.state == RecvState::Line {
            self.recv_line(buf);
        }
        if self.state == RecvState::Head {
            self.recv_head(buf);
        }
        if self.state == RecvState::Body {
            self.recv_body(buf);
        }
    }

    fn recv_line(&mut self, buf: &mut Buffer) {
        let Some(line) = buf.take_line() else {
            if buf.remaining() > MAX_LINE {
                self.fail(414);
            }
            return;
        };
        if line.len() > MAX_LINE {
            return self.fail(414);
        }
        let Ok(line) = String::from_utf8(line) else {
            return self.fail(400);
        };
        match parse_request_line(&line, &mut self.request) {
            Ok(()) => self.state = RecvState::Head,
            Err(_) => self.fail(400),
        }
    }

    fn recv_head(&mut self, buf: &mut Buffer) {
        loop {
            let Some(line) = buf.take_line() else {
                if buf.remaining() > MAX_LINE {
                    self.fail(414);
                }
                return;
            };
            if line.len() > MAX_LINE {
                return self.fail(414);
            }
            if line == b"\r\n" || line == b"\n" {
                self.state = RecvState::Body;
                return;
            }
            let Ok(line) = String::from_utf8(line) else {
                return self.fail(400);
            };
            match parse_header_line(&line) {
                Ok((key, value)) => self.request.set_header(key, value),
                Err(_) => return self.fail(400),
            }
        }
    }

    fn recv_body(&mut self, buf: &mut Buffer) {
        let length = match self.request.content_length() {
            Ok(length) => length,
            Err(_) => return self.fail(400),
        };
        if self.request.body.len() >= length {
            self.state = RecvState::Over;
            return;
        }
        let need = length - self.request.body.len();
        let chunk = buf.take(need);
        self.request.body.extend_from_slice(&chunk);
        if self.request.body.len() == length {
            self.state = RecvState::Over;
        }
    }
}

impl Default for HttpContext {
    fn default() -> HttpContext {
        HttpContext::new()
    }
}
