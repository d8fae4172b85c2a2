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

//! Readiness multiplexing over file descriptors

use std::io::ErrorKind;

use bitflags::bitflags;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token};

use crate::fatal;

bitflags! {
    /// The readiness (and interest) set of one descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ready: u8 {
        /// Input, priority input, or peer shutdown of its write side.
        const READABLE = 0b0001;
        /// Output space available.
        const WRITABLE = 0b0010;
        /// Descriptor error condition.
        const ERROR    = 0b0100;
        /// Hang-up: both directions are gone.
        const CLOSED   = 0b1000;
    }
}

pub(crate) fn ready_from_event(event: &Event) -> Ready {
    let mut ready = Ready::empty();
    if event.is_readable() || event.is_priority() || event.is_read_closed() {
        ready |= Ready::READABLE;
    }
    if event.is_writable() {
        ready |= Ready::WRITABLE;
    }
    if event.is_error() {
        ready |= Ready::ERROR;
    }
    if event.is_read_closed() && event.is_write_closed() {
        ready |= Ready::CLOSED;
    }
    ready
}

const EVENT_CAPACITY: usize = 1024;

/// Blocking readiness source for one loop. Registration happens through the
/// cloned [`Registry`] handed out by [`Poller::registry`]; polling is
/// exclusive to the owning loop.
#[derive(Debug)]
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    /// Creates the kernel readiness object. Failure here is unrecoverable
    /// and aborts the process.
    pub fn new() -> Poller {
        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => fatal("poll creation failed", &err),
        };
        Poller {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
        }
    }

    /// An owned registration handle, shareable with the loop's channels.
    pub fn registry(&self) -> Registry {
        match self.poll.registry().try_clone() {
            Ok(registry) => registry,
            Err(err) => fatal("registry clone failed", &err),
        }
    }

    /// Blocks until at least one descriptor is ready, then feeds every
    /// `(token, readiness)` pair to `f`. An interrupting signal is a no-op;
    /// any other poll failure aborts the process.
    pub fn poll(&mut self, mut f: impl FnMut(Token, Ready)) {
        match self.poll.poll(&mut self.events, None) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return,
            Err(err) => fatal("poll failed", &err),
        }
        for event in self.events.iter() {
            f(event.token(), ready_from_event(event));
        }
    }
}

impl Default for Poller {
    fn default() -> Poller {
        Poller::new()
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn ready_flags_compose() {
        let r = Ready::READABLE | Ready::WRITABLE;
        assert!(r.contains(Ready::READABLE));
        assert!(r.contains(Ready::WRITABLE));
        assert!(!r.contains(Ready::ERROR));
        assert!(r.intersects(Ready::READABLE | Ready::CLOSED));
    }
}
