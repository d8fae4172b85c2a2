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

//! Passive socket and accept dispatch

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket;

/// Callback receiving each accepted socket.
pub type AcceptCallback = Box<dyn Fn(OwnedFd) + Send + Sync>;

/// The listening endpoint, owned by the base loop. On read readiness it
/// drains every pending accept and hands the raw sockets to the registered
/// callback.
pub struct Acceptor {
    fd: OwnedFd,
    channel: Arc<Channel>,
    on_accept: Mutex<Option<AcceptCallback>>,
}

impl Acceptor {
    /// Binds `0.0.0.0:<port>` and prepares the accept channel on `lp`.
    /// Read interest stays off until [`Acceptor::listen`]; enabling it
    /// before the callback is installed would drop early connections.
    pub fn new(lp: &LoopHandle, port: u16) -> io::Result<Arc<Acceptor>> {
        let fd = socket::bind_listener(port)?;
        let channel = Channel::new(lp, fd.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            fd,
            channel,
            on_accept: Mutex::new(None),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    /// Installs the accept callback.
    pub fn set_accept_callback(&self, f: impl Fn(OwnedFd) + Send + Sync + 'static) {
        *self.on_accept.lock().unwrap() = Some(Box::new(f));
    }

    /// Starts watching for incoming connections.
    pub fn listen(&self) {
        self.channel.enable_read();
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        socket::local_port(self.fd.as_raw_fd()).unwrap_or(0)
    }

    fn handle_read(&self) {
        let on_accept = self.on_accept.lock().unwrap();
        loop {
            match socket::accept(self.fd.as_raw_fd()) {
                Ok(Some(peer)) => {
                    if let Some(cb) = on_accept.as_ref() {
                        cb(peer);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.fd.as_raw_fd())
            .field("port", &self.port())
            .finish()
    }
}
