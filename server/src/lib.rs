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

//! virvel is a multi-reactor TCP server core with an HTTP/1.1 layer.
//!
//! One base loop accepts connections and round-robins them onto a fixed
//! pool of worker loops. Each loop is a single pinned thread multiplexing
//! readiness, running channel callbacks, draining cross-thread tasks and
//! driving a hashed timer wheel for idle eviction. The HTTP layer sits on
//! the same connections as an incremental request parser plus regex route
//! dispatch and static-file serving.
//!
//! ## Examples
//!
//! Demo servers live in the `examples` directory: an echo server and an
//! HTTP file server.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod http;
pub mod loop_thread;
pub mod poller;
pub mod server;
mod socket;
mod timer;

pub use buffer::Buffer;
pub use connection::{ConnRef, ConnState, Connection};
pub use event_loop::{EventLoop, LoopHandle};
pub use http::HttpServer;
pub use server::TcpServer;

use log::error;

/// Kernel primitives the loops cannot exist without (poller, waker,
/// timerfd) have no recovery path: log and abort.
pub(crate) fn fatal(what: &str, err: &std::io::Error) -> ! {
    error!("{what}: {err}");
    std::process::abort();
}
