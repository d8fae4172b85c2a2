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

//! HTTP/1.1 server on top of the TCP core

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use parser::h1::request::Request;
use parser::h1::response::Response;
use parser::status::reason_phrase;
use parser::Method;
use regex::Regex;

pub mod context;
mod fs;

use crate::buffer::Buffer;
use crate::connection::ConnRef;
use crate::event_loop::LoopHandle;
use crate::server::TcpServer;
use context::{HttpContext, RecvState};

/// A route handler: reads the request, fills in the response.
pub type Handler = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;

type RouteTable = Vec<(Regex, Handler)>;

struct Router {
    get: RouteTable,
    post: RouteTable,
    put: RouteTable,
    delete: RouteTable,
    basedir: Option<PathBuf>,
}

/// An HTTP/1.1 server: per-method regex route tables, optional static-file
/// base directory, keep-alive handling.
///
/// Routes are matched against the decoded path in registration order; the
/// whole path must match the pattern. The first match wins and its capture
/// groups are stored on the request.
pub struct HttpServer {
    server: TcpServer,
    get: RouteTable,
    post: RouteTable,
    put: RouteTable,
    delete: RouteTable,
    basedir: Option<PathBuf>,
}

impl HttpServer {
    /// Binds the server. Bind failure is returned, not fatal.
    pub fn new(port: u16) -> io::Result<HttpServer> {
        Ok(HttpServer {
            server: TcpServer::new(port)?,
            get: Vec::new(),
            post: Vec::new(),
            put: Vec::new(),
            delete: Vec::new(),
            basedir: None,
        })
    }

    fn compile(pattern: &str) -> Regex {
        Regex::new(&format!("^(?:{pattern})$")).expect("invalid route pattern")
    }

    /// Registers a GET route. HEAD requests dispatch through this table
    /// too, when the static check does not claim them first.
    pub fn get(&mut self, pattern: &str, handler: impl Fn(&Request, &mut Response) + Send + Sync + 'static) {
        self.get.push((Self::compile(pattern), Arc::new(handler)));
    }

    /// Registers a POST route.
    pub fn post(&mut self, pattern: &str, handler: impl Fn(&Request, &mut Response) + Send + Sync + 'static) {
        self.post.push((Self::compile(pattern), Arc::new(handler)));
    }

    /// Registers a PUT route.
    pub fn put(&mut self, pattern: &str, handler: impl Fn(&Request, &mut Response) + Send + Sync + 'static) {
        self.put.push((Self::compile(pattern), Arc::new(handler)));
    }

    /// Registers a DELETE route.
    pub fn delete(&mut self, pattern: &str, handler: impl Fn(&Request, &mut Response) + Send + Sync + 'static) {
        self.delete.push((Self::compile(pattern), Arc::new(handler)));
    }

    /// Serves static files for GET/HEAD out of `basedir`.
    pub fn set_basedir(&mut self, basedir: impl Into<PathBuf>) {
        self.basedir = Some(basedir.into());
    }

    /// Sets the worker loop count.
    pub fn set_thread_count(&self, count: usize) {
        self.server.set_thread_count(count);
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// The base loop's handle; `quit` on it ends [`HttpServer::start`].
    pub fn handle(&self) -> LoopHandle {
        self.server.handle()
    }

    /// Freezes the route tables, wires the HTTP callbacks onto the TCP
    /// server and runs it.
    pub fn start(&mut self) {
        let router = Arc::new(Router {
            get: std::mem::take(&mut self.get),
            post: std::mem::take(&mut self.post),
            put: std::mem::take(&mut self.put),
            delete: std::mem::take(&mut self.delete),
            basedir: self.basedir.take(),
        });
        self.server
            .set_connected_callback(|conn| conn.set_context(HttpContext::new()));
        self.server.set_message_callback(move |conn, buf| {
            on_message(&router, conn, buf);
        });
        self.server.start();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("port", &self.port())
            .field(
                "routes",
                &(self.get.len() + self.post.len() + self.put.len() + self.delete.len()),
            )
            .field("basedir", &self.basedir)
            .finish()
    }
}

/// Renders the default HTML error page for the response's status.
fn error_page(resp: &mut Response) {
    let code = resp.status();
    let body = format!(
        "<html><head><meta http-equiv='Content-Type' \
         content='text/html;charset=utf-8'></head><body><h1>{} {}</h1></body></html>",
        code,
        reason_phrase(code)
    );
    resp.set_content(body.into_bytes(), "text/html");
}

fn dispatch(table: &RouteTable, req: &mut Request, resp: &mut Response) {
    for (pattern, handler) in table {
        if let Some(caps) = pattern.captures(&req.path) {
            req.captures = caps
                .iter()
                .map(|m| m.map_or(String::new(), |m| m.as_str().to_string()))
                .collect();
            return handler(req, resp);
        }
    }
    debug!("no route for {} {}", req.method, req.path);
    resp.set_status(404);
}

fn route(router: &Router, req: &mut Request, resp: &mut Response) {
    if fs::is_static_request(&router.basedir, req) {
        if let Some(basedir) = &router.basedir {
            fs::serve(basedir, req, resp);
        }
        return;
    }
    match req.method {
        Method::Get | Method::Head => dispatch(&router.get, req, resp),
        Method::Post => dispatch(&router.post, req, resp),
        Method::Put => dispatch(&router.put, req, resp),
        Method::Delete => dispatch(&router.delete, req, resp),
    }
}

/// Drives the per-connection context over freshly arrived bytes, emitting
/// one response per completed request until the buffer runs dry.
fn on_message(router: &Router, conn: &ConnRef, buf: &mut Buffer) {
    while buf.remaining() > 0 {
        let mut guard = conn.context();
        let Some(ctx) = guard
            .as_mut()
            .and_then(|ctx| ctx.downcast_mut::<HttpContext>())
        else {
            return;
        };

        ctx.recv(buf);

        if ctx.status() >= 400 {
            // Protocol error: answer with the latched status and keep the
            // connection only when the client explicitly asked for it.
            let mut resp = Response::new(ctx.status());
            error_page(&mut resp);
            let keep = ctx
                .request()
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"));
            let bytes = resp.serialize(!keep);
            ctx.reset();
            drop(guard);
            conn.send(&bytes);
            if !keep {
                conn.shutdown();
            }
            return;
        }

        if ctx.state() != RecvState::Over {
            return;
        }

        let mut resp = Response::new(200);
        route(router, ctx.request_mut(), &mut resp);
        if resp.status() >= 400 && resp.body.is_empty() {
            error_page(&mut resp);
        }
        let close = ctx.request().wants_close()
            || resp
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        let bytes = resp.serialize(close);
        ctx.reset();
        drop(guard);
        conn.send(&bytes);
        if close {
            conn.shutdown();
            return;
        }
    }
}
