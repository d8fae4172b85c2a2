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

//! Binding of one descriptor to its owning loop and callbacks

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mio::Token;

use crate::event_loop::{LoopHandle, LoopShared};
use crate::poller::Ready;

/// Callback invoked for one kind of readiness on one descriptor.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
    any_event: Option<EventCallback>,
}

/// Registration record binding one descriptor to the loop that owns it.
///
/// Holds the watched-interest set, the last readiness observed by the
/// poller, and up to five callbacks. The channel does not own the
/// descriptor; its owner keeps the fd alive for the channel's lifetime and
/// calls [`Channel::remove`] before closing it. State is only mutated from
/// the owning loop's thread.
pub struct Channel {
    fd: RawFd,
    token: Token,
    lp: Weak<LoopShared>,
    interest: Mutex<Ready>,
    revents: Mutex<Ready>,
    registered: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(lp: &LoopHandle, fd: RawFd) -> Arc<Channel> {
        let shared = lp.shared();
        let mut channels = shared.channels.lock().unwrap();
        let entry = channels.vacant_entry();
        let channel = Arc::new(Channel {
            fd,
            token: Token(entry.key()),
            lp: Arc::downgrade(shared),
            interest: Mutex::new(Ready::empty()),
            revents: Mutex::new(Ready::empty()),
            registered: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        });
        entry.insert(channel.clone());
        channel
    }

    /// The wrapped descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The poll token assigned by the owning loop.
    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn interest(&self) -> Ready {
        *self.interest.lock().unwrap()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    pub(crate) fn set_registered(&self, on: bool) {
        self.registered.store(on, Ordering::Relaxed);
    }

    /// Whether read readiness is currently watched.
    pub fn reading(&self) -> bool {
        self.interest().contains(Ready::READABLE)
    }

    /// Whether write readiness is currently watched.
    pub fn writing(&self) -> bool {
        self.interest().contains(Ready::WRITABLE)
    }

    /// Starts watching read readiness.
    pub fn enable_read(&self) {
        self.set_interest(Ready::READABLE, true);
    }

    /// Stops watching read readiness.
    pub fn disable_read(&self) {
        self.set_interest(Ready::READABLE, false);
    }

    /// Starts watching write readiness.
    pub fn enable_write(&self) {
        self.set_interest(Ready::WRITABLE, true);
    }

    /// Stops watching write readiness.
    pub fn disable_write(&self) {
        self.set_interest(Ready::WRITABLE, false);
    }

    /// Stops watching everything, leaving the channel registered with the
    /// loop for later re-enabling.
    pub fn disable_all(&self) {
        *self.interest.lock().unwrap() = Ready::empty();
        self.update();
    }

    fn set_interest(&self, flag: Ready, on: bool) {
        {
            let mut interest = self.interest.lock().unwrap();
            interest.set(flag, on);
        }
        self.update();
    }

    fn update(&self) {
        if let Some(lp) = self.lp.upgrade() {
            lp.update_channel(self);
        }
    }

    /// Unregisters from the poller and forgets the channel on the owning
    /// loop. The owner may close the descriptor afterwards.
    pub fn remove(&self) {
        if let Some(lp) = self.lp.upgrade() {
            lp.remove_channel(self);
        }
    }

    /// Replaces the read callback.
    pub fn set_read_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().read = Some(Arc::new(f));
    }

    /// Replaces the write callback.
    pub fn set_write_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().write = Some(Arc::new(f));
    }

    /// Replaces the close callback.
    pub fn set_close_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().close = Some(Arc::new(f));
    }

    /// Replaces the error callback.
    pub fn set_error_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().error = Some(Arc::new(f));
    }

    /// Replaces the any-event callback, which runs after every dispatch.
    pub fn set_any_event_callback(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().any_event = Some(Arc::new(f));
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        *self.revents.lock().unwrap() = revents;
    }

    /// Dispatches the last observed readiness.
    ///
    /// Read fires first. Write, error and close are mutually exclusive per
    /// dispatch: a hang-up arriving together with write readiness must not
    /// release the connection twice. The any-event callback always runs
    /// last.
    pub(crate) fn handle_event(&self) {
        let revents = *self.revents.lock().unwrap();
        let (read, write, close, error, any_event) = {
            let cbs = self.callbacks.lock().unwrap();
            (
                cbs.read.clone(),
                cbs.write.clone(),
                cbs.close.clone(),
                cbs.error.clone(),
                cbs.any_event.clone(),
            )
        };

        if revents.contains(Ready::READABLE) {
            if let Some(cb) = read {
                cb();
            }
        }

        if revents.contains(Ready::WRITABLE) {
            if let Some(cb) = write {
                cb();
            }
        } else if revents.contains(Ready::ERROR) {
            if let Some(cb) = error {
                cb();
            }
        } else if revents.contains(Ready::CLOSED) {
            if let Some(cb) = close {
                cb();
            }
        }

        if let Some(cb) = any_event {
            cb();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .field("interest", &self.interest())
            .field("registered", &self.is_registered())
            .finish()
    }
}
