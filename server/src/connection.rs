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

//! Per-socket connection lifecycle

use std::any::Any;
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;

/// Shared handle to a connection. Every user callback receives one, so the
/// connection always outlives the callback that might release it.
pub type ConnRef = Arc<Connection>;

/// Callback fired with the connection itself (connected, closed, any-event).
pub type ConnectionCallback = Arc<dyn Fn(&ConnRef) + Send + Sync>;

/// Callback fired when bytes arrive, with the connection's input buffer.
pub type MessageCallback = Arc<dyn Fn(&ConnRef, &mut Buffer) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, not yet watched.
    Connecting = 0,
    /// Live and watched for reads.
    Connected = 1,
    /// Closing once the output buffer drains.
    Disconnecting = 2,
    /// Released.
    Disconnected = 3,
}

#[derive(Default)]
struct UserCallbacks {
    connected: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    closed: Option<ConnectionCallback>,
    any_event: Option<ConnectionCallback>,
}

/// One TCP connection, pinned to its owning loop for life.
///
/// The public operations are thread-safe: each posts its in-loop body
/// through the owning loop, which runs it inline when already on that
/// thread. All mutable state (buffers, callbacks, context) sits behind
/// leaf mutexes that are only ever contended during server shutdown,
/// because every touch happens on the pinned loop.
///
/// Stored callbacks hold only a weak self-link; the strong self-reference
/// handed to user callbacks is minted at dispatch time, so a connection the
/// server forgets mid-callback still outlives the call.
pub struct Connection {
    id: u64,
    stream: TcpStream,
    lp: LoopHandle,
    channel: Arc<Channel>,
    weak_self: Weak<Connection>,
    state: AtomicU8,
    inactive_release: AtomicBool,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    callbacks: Mutex<UserCallbacks>,
    server_close: Mutex<Option<ConnectionCallback>>,
}

/// Scratch size for one drain pass of the socket.
const READ_CHUNK: usize = 65535;

impl Connection {
    /// Wraps an accepted socket into a connection owned by `lp`.
    pub fn new(lp: LoopHandle, id: u64, fd: OwnedFd) -> ConnRef {
        let stream = TcpStream::from(fd);
        let channel = Channel::new(&lp, stream.as_raw_fd());
        let conn = Arc::new_cyclic(|weak: &Weak<Connection>| Connection {
            id,
            stream,
            lp,
            channel,
            weak_self: weak.clone(),
            state: AtomicU8::new(ConnState::Connecting as u8),
            inactive_release: AtomicBool::new(false),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
            callbacks: Mutex::new(UserCallbacks::default()),
            server_close: Mutex::new(None),
        });

        conn.channel.set_read_callback({
            let weak = conn.weak_self.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }
        });
        conn.channel.set_write_callback({
            let weak = conn.weak_self.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        });
        conn.channel.set_close_callback({
            let weak = conn.weak_self.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        });
        conn.channel.set_error_callback({
            let weak = conn.weak_self.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }
        });
        conn.channel.set_any_event_callback({
            let weak = conn.weak_self.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_any_event();
                }
            }
        });
        conn
    }

    /// A fresh strong self-reference. `None` only while the connection is
    /// already being torn down, in which case there is nobody to call.
    fn shared_self(&self) -> Option<ConnRef> {
        self.weak_self.upgrade()
    }

    /// The connection's server-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::SeqCst) {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Whether the connection is live.
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The owning loop's handle.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.lp
    }

    /// Attaches a protocol context, replacing any existing one.
    pub fn set_context(&self, context: impl Any + Send) {
        *self.context.lock().unwrap() = Some(Box::new(context));
    }

    /// The opaque protocol context slot.
    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.context.lock().unwrap()
    }

    /// Replaces the connected callback.
    pub fn set_connected_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connected = Some(cb);
    }

    /// Replaces the message callback.
    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    /// Replaces the closed callback.
    pub fn set_closed_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().closed = Some(cb);
    }

    /// Replaces the any-event callback.
    pub fn set_any_event_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().any_event = Some(cb);
    }

    /// Installs the server-scoped close hook, which runs after the user
    /// closed callback on release.
    pub fn set_server_close_callback(&self, cb: ConnectionCallback) {
        *self.server_close.lock().unwrap() = Some(cb);
    }

    /// Queues `data` for transmission. Dropped silently unless the
    /// connection is in the `Connected` state when the append runs on the
    /// owning loop.
    pub fn send(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(conn) = self.shared_self() else { return };
        let data = data.to_vec();
        self.lp.run_in_loop(move || conn.send_in_loop(&data));
    }

    /// Begins an orderly close: pending input is flushed to the message
    /// callback, pending output drains first, then the connection releases.
    pub fn shutdown(&self) {
        let Some(conn) = self.shared_self() else { return };
        self.lp.run_in_loop(move || conn.shutdown_in_loop());
    }

    /// Releases immediately, without waiting for the output buffer.
    pub fn release(&self) {
        let Some(conn) = self.shared_self() else { return };
        self.lp.run_in_loop(move || conn.release_in_loop());
    }

    /// Completes the handoff of a freshly accepted connection: enables
    /// read interest and fires the connected callback.
    pub fn established(&self) {
        let Some(conn) = self.shared_self() else { return };
        self.lp.run_in_loop(move || conn.established_in_loop());
    }

    /// Arms automatic release after `secs` with no socket activity. Any
    /// event on the connection pushes the deadline out again.
    pub fn enable_inactive_release(&self, secs: u32) {
        let Some(conn) = self.shared_self() else { return };
        self.lp
            .run_in_loop(move || conn.enable_inactive_release_in_loop(secs));
    }

    /// Disarms automatic idle release.
    pub fn cancel_inactive_release(&self) {
        let Some(conn) = self.shared_self() else { return };
        self.lp
            .run_in_loop(move || conn.cancel_inactive_release_in_loop());
    }

    /// Switches protocols: replaces the context and all four user
    /// callbacks at once.
    ///
    /// Must run on the owning loop (asserted) so no event can slip in
    /// between the old handlers and the new ones.
    pub fn upgrade(
        &self,
        context: impl Any + Send,
        connected: ConnectionCallback,
        message: MessageCallback,
        closed: ConnectionCallback,
        any_event: ConnectionCallback,
    ) {
        self.lp.assert_in_loop();
        *self.context.lock().unwrap() = Some(Box::new(context));
        let mut cbs = self.callbacks.lock().unwrap();
        cbs.connected = Some(connected);
        cbs.message = Some(message);
        cbs.closed = Some(closed);
        cbs.any_event = Some(any_event);
    }

    /// Hands pending input to the message callback. When called from
    /// inside the message callback itself (the input lock is already
    /// held), the flush is skipped: that invocation is already processing
    /// the buffer.
    fn deliver_pending(&self) {
        let cb = self.callbacks.lock().unwrap().message.clone();
        let Some(cb) = cb else { return };
        let Some(conn) = self.shared_self() else { return };
        let Ok(mut input) = self.input.try_lock() else {
            return;
        };
        if input.remaining() > 0 {
            cb(&conn, &mut input);
        }
    }

    fn handle_read(&self) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match (&self.stream).read(&mut scratch) {
                Ok(0) => return self.shutdown_in_loop(),
                Ok(n) => self.input.lock().unwrap().extend(&scratch[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("read failed on connection {}: {err}", self.id);
                    return self.shutdown_in_loop();
                }
            }
        }
        self.deliver_pending();
    }

    fn handle_write(&self) {
        let mut output = self.output.lock().unwrap();
        while output.remaining() > 0 {
            match (&self.stream).write(&output) {
                Ok(0) => {
                    warn!("zero-length write on connection {}", self.id);
                    drop(output);
                    self.deliver_pending();
                    return self.release_in_loop();
                }
                Ok(n) => output.mark_read(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("write failed on connection {}: {err}", self.id);
                    drop(output);
                    self.deliver_pending();
                    return self.release_in_loop();
                }
            }
        }
        drop(output);
        self.channel.disable_write();
        if self.state() == ConnState::Disconnecting {
            self.release_in_loop();
        }
    }

    fn handle_close(&self) {
        self.deliver_pending();
        self.release_in_loop();
    }

    fn handle_error(&self) {
        self.handle_close();
    }

    fn handle_any_event(&self) {
        if self.connected() && self.inactive_release.load(Ordering::Relaxed) {
            self.lp.timer_refresh(self.id);
        }
        let cb = self.callbacks.lock().unwrap().any_event.clone();
        if let Some(cb) = cb {
            if let Some(conn) = self.shared_self() {
                cb(&conn);
            }
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        let mut output = self.output.lock().unwrap();
        output.extend(data);
        if output.remaining() > 0 {
            self.channel.enable_write();
        }
    }

    fn shutdown_in_loop(&self) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        self.set_state(ConnState::Disconnecting);
        self.deliver_pending();
        let pending = self.output.lock().unwrap().remaining();
        if pending > 0 {
            self.channel.enable_write();
        } else {
            self.release_in_loop();
        }
    }

    /// The unique terminal action. The state check makes it idempotent
    /// even when a close and an error land in the same poll batch.
    fn release_in_loop(&self) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        self.set_state(ConnState::Disconnected);
        self.channel.remove();
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!("socket shutdown on connection {}: {err}", self.id);
        }
        if self.lp.has_timer(self.id) {
            self.lp.timer_cancel(self.id);
        }
        let Some(conn) = self.shared_self() else { return };
        let closed = self.callbacks.lock().unwrap().closed.clone();
        if let Some(cb) = closed {
            cb(&conn);
        }
        let server_close = self.server_close.lock().unwrap().clone();
        if let Some(cb) = server_close {
            cb(&conn);
        }
    }

    fn established_in_loop(&self) {
        assert_eq!(ConnState::Connecting, self.state());
        self.set_state(ConnState::Connected);
        self.channel.enable_read();
        let cb = self.callbacks.lock().unwrap().connected.clone();
        if let Some(cb) = cb {
            if let Some(conn) = self.shared_self() {
                cb(&conn);
            }
        }
    }

    fn enable_inactive_release_in_loop(&self, secs: u32) {
        self.inactive_release.store(true, Ordering::Relaxed);
        if self.lp.has_timer(self.id) {
            self.lp.timer_refresh(self.id);
        } else {
            let weak = self.weak_self.clone();
            self.lp.timer_add(self.id, secs, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.release();
                }
            });
        }
    }

    fn cancel_inactive_release_in_loop(&self) {
        self.inactive_release.store(false, Ordering::Relaxed);
        if self.lp.has_timer(self.id) {
            self.lp.timer_cancel(self.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.stream.as_raw_fd())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::ConnState;

    #[test]
    fn state_roundtrips_through_its_discriminant() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            let raw = state as u8;
            let back = match raw {
                0 => ConnState::Connecting,
                1 => ConnState::Connected,
                2 => ConnState::Disconnecting,
                _ => ConnState::Disconnected,
            };
            assert_eq!(state, back);
        }
    }
}
