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

//! TCP server: acceptor, worker pool, connection registry

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{ConnRef, Connection, ConnectionCallback, MessageCallback};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::LoopThreadPool;

/// Ids for `run_after`/`run_every` shortcuts live far above the connection
/// id range, so both can share a loop's timer wheel.
const TIMER_ID_BASE: u64 = 1 << 48;

struct ServerShared {
    next_id: AtomicU64,
    next_timer_id: AtomicU64,
    conns: Mutex<HashMap<u64, ConnRef>>,
    connected: Mutex<Option<ConnectionCallback>>,
    message: Mutex<Option<MessageCallback>>,
    closed: Mutex<Option<ConnectionCallback>>,
    any_event: Mutex<Option<ConnectionCallback>>,
}

/// Cloneable probe for the live-connection count, usable from timer tasks
/// after the server itself has been moved into its loop.
#[derive(Clone)]
pub struct ConnCounter {
    shared: Weak<ServerShared>,
}

impl ConnCounter {
    /// The number of currently registered connections.
    pub fn get(&self) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.conns.lock().unwrap().len())
    }
}

impl fmt::Debug for ConnCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnCounter").field("count", &self.get()).finish()
    }
}

/// A multi-reactor TCP server.
///
/// The base loop accepts and owns the id-to-connection registry; every
/// accepted socket is pinned round-robin onto one worker loop (or the base
/// loop when the pool is empty) for the rest of its life.
pub struct TcpServer {
    base: EventLoop,
    pool: Arc<LoopThreadPool>,
    acceptor: Arc<Acceptor>,
    shared: Arc<ServerShared>,
}

impl TcpServer {
    /// Binds the listening endpoint. A bind failure is returned to the
    /// caller rather than aborting.
    pub fn new(port: u16) -> io::Result<TcpServer> {
        let base = EventLoop::new();
        let acceptor = Acceptor::new(&base.handle(), port)?;
        let pool = Arc::new(LoopThreadPool::new(base.handle()));
        Ok(TcpServer {
            base,
            pool,
            acceptor,
            shared: Arc::new(ServerShared {
                next_id: AtomicU64::new(0),
                next_timer_id: AtomicU64::new(TIMER_ID_BASE),
                conns: Mutex::new(HashMap::new()),
                connected: Mutex::new(None),
                message: Mutex::new(None),
                closed: Mutex::new(None),
                any_event: Mutex::new(None),
            }),
        })
    }

    /// Sets the worker loop count. Must precede [`TcpServer::start`].
    pub fn set_thread_count(&self, count: usize) {
        self.pool.set_thread_count(count);
    }

    /// Callback fired once per connection after it is established.
    pub fn set_connected_callback(&self, f: impl Fn(&ConnRef) + Send + Sync + 'static) {
        *self.shared.connected.lock().unwrap() = Some(Arc::new(f));
    }

    /// Callback fired whenever a connection's input buffer has bytes.
    pub fn set_message_callback(&self, f: impl Fn(&ConnRef, &mut Buffer) + Send + Sync + 'static) {
        *self.shared.message.lock().unwrap() = Some(Arc::new(f));
    }

    /// Callback fired as a connection releases.
    pub fn set_closed_callback(&self, f: impl Fn(&ConnRef) + Send + Sync + 'static) {
        *self.shared.closed.lock().unwrap() = Some(Arc::new(f));
    }

    /// Callback fired on every event a connection sees.
    pub fn set_any_event_callback(&self, f: impl Fn(&ConnRef) + Send + Sync + 'static) {
        *self.shared.any_event.lock().unwrap() = Some(Arc::new(f));
    }

    /// Runs `task` once on the base loop after `delay_secs` (wheel-bounded,
    /// at most 60s).
    pub fn run_after(&self, delay_secs: u32, task: impl FnOnce() + Send + 'static) {
        let id = self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.base.handle().timer_add(id, delay_secs, task);
    }

    /// Runs `task` on the base loop every `interval_secs` (wheel-bounded,
    /// at most 60s).
    pub fn run_every(&self, interval_secs: u32, task: impl Fn() + Send + Sync + 'static) {
        let id = self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed);
        schedule_every(self.base.handle(), id, interval_secs, Arc::new(task));
    }

    /// The number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.conns.lock().unwrap().len()
    }

    /// A cloneable connection-count probe.
    pub fn counter(&self) -> ConnCounter {
        ConnCounter {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The port actually bound (resolves a port-0 bind).
    pub fn port(&self) -> u16 {
        self.acceptor.port()
    }

    /// The base loop's handle; `quit` on it ends [`TcpServer::start`].
    pub fn handle(&self) -> LoopHandle {
        self.base.handle()
    }

    /// Starts the pool and the listener, then runs the base loop until it
    /// is quit. Workers are joined on the way out.
    pub fn start(&mut self) {
        self.pool.start();
        let shared = self.shared.clone();
        let pool = self.pool.clone();
        let base = self.base.handle();
        self.acceptor.set_accept_callback(move |fd| {
            new_connection(&shared, &pool, &base, fd);
        });
        self.acceptor.listen();
        self.base.run();
        self.pool.stop();
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("port", &self.port())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Runs on the base loop for every accepted socket: assign an id, pick a
/// worker, wire callbacks and the registry-erase hook, register, establish.
fn new_connection(
    shared: &Arc<ServerShared>,
    pool: &Arc<LoopThreadPool>,
    base: &LoopHandle,
    fd: OwnedFd,
) {
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let lp = pool.next_loop();
    let conn = Connection::new(lp, id, fd);

    if let Some(cb) = shared.connected.lock().unwrap().clone() {
        conn.set_connected_callback(cb);
    }
    if let Some(cb) = shared.message.lock().unwrap().clone() {
        conn.set_message_callback(cb);
    }
    if let Some(cb) = shared.closed.lock().unwrap().clone() {
        conn.set_closed_callback(cb);
    }
    if let Some(cb) = shared.any_event.lock().unwrap().clone() {
        conn.set_any_event_callback(cb);
    }

    let weak = Arc::downgrade(shared);
    let base = base.clone();
    conn.set_server_close_callback(Arc::new(move |conn: &ConnRef| {
        let id = conn.id();
        let Some(shared) = weak.upgrade() else { return };
        base.run_in_loop(move || {
            shared.conns.lock().unwrap().remove(&id);
        });
    }));

    shared.conns.lock().unwrap().insert(id, conn.clone());
    debug!("connection {id} accepted");
    conn.established();
}

fn schedule_every(lp: LoopHandle, id: u64, interval_secs: u32, task: Arc<dyn Fn() + Send + Sync>) {
    let next = lp.clone();
    lp.timer_add(id, interval_secs, move || {
        task();
        schedule_every(next, id, interval_secs, task);
    });
}
