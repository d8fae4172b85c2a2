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

//! Single-threaded event-dispatch loop

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use log::warn;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token, Waker};
use slab::Slab;

use crate::channel::Channel;
use crate::fatal;
use crate::poller::{Poller, Ready};
use crate::timer::TimerWheel;

/// Work posted onto a loop from any thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Token reserved for the loop's wake-up descriptor; channel tokens come
/// from the slab and never reach it.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// State shared between a loop and everything that posts work to it.
pub(crate) struct LoopShared {
    pub(crate) registry: Registry,
    waker: Waker,
    owner: Mutex<ThreadId>,
    quit: AtomicBool,
    pending: Mutex<Vec<Task>>,
    pub(crate) channels: Mutex<Slab<Arc<Channel>>>,
    wheel: Mutex<TimerWheel>,
}

impl LoopShared {
    fn run_pending(&self) {
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
    }

    /// Registers, re-registers or deregisters `channel` according to its
    /// interest set. mio rejects empty interest sets, so watching nothing
    /// means deregistering until something is re-enabled.
    pub(crate) fn update_channel(&self, channel: &Channel) {
        let fd = channel.fd();
        let mut source = SourceFd(&fd);
        let result = match mio_interest(channel.interest()) {
            Some(interest) if channel.is_registered() => {
                self.registry
                    .reregister(&mut source, channel.token(), interest)
            }
            Some(interest) => {
                channel.set_registered(true);
                self.registry
                    .register(&mut source, channel.token(), interest)
            }
            None if channel.is_registered() => {
                channel.set_registered(false);
                self.registry.deregister(&mut source)
            }
            None => Ok(()),
        };
        if let Err(err) = result {
            warn!("event registration failed for fd {fd}: {err}");
        }
    }

    /// Deregisters `channel` and forgets its token.
    pub(crate) fn remove_channel(&self, channel: &Channel) {
        if channel.is_registered() {
            channel.set_registered(false);
            let fd = channel.fd();
            let mut source = SourceFd(&fd);
            if let Err(err) = self.registry.deregister(&mut source) {
                warn!("event deregistration failed for fd {fd}: {err}");
            }
        }
        self.channels.lock().unwrap().try_remove(channel.token().0);
    }

    /// One wheel tick: expired entries fire outside the wheel lock, so a
    /// task may re-enter the wheel (cancel, re-add) freely.
    pub(crate) fn advance_wheel(&self) {
        let expired = self.wheel.lock().unwrap().advance();
        for entry in expired {
            entry.fire();
        }
    }
}

fn mio_interest(ready: Ready) -> Option<Interest> {
    match (
        ready.contains(Ready::READABLE),
        ready.contains(Ready::WRITABLE),
    ) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Cloneable, thread-safe handle to one loop: post work, drive timers,
/// request shutdown.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    /// Whether the caller is on the loop's own thread.
    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == *self.shared.owner.lock().unwrap()
    }

    /// Debug contract: abort when called off the owning thread.
    pub fn assert_in_loop(&self) {
        assert!(
            self.is_in_loop(),
            "operation requires the loop's own thread"
        );
    }

    /// Runs `task` inline when called on the loop's thread, otherwise
    /// enqueues it for the end of the next iteration.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` and wakes the loop. A single wake is sufficient; the
    /// loop drains the whole queue every iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        if let Err(err) = self.shared.waker.wake() {
            warn!("loop wake-up failed: {err}");
        }
    }

    /// Makes the loop exit after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if let Err(err) = self.shared.waker.wake() {
            warn!("loop wake-up failed: {err}");
        }
    }

    /// Schedules `task` to run once, `delay_secs` ticks from now (clamped
    /// to the wheel's 60s span).
    pub fn timer_add(&self, id: u64, delay_secs: u32, task: impl FnOnce() + Send + 'static) {
        let shared = self.shared.clone();
        self.run_in_loop(move || {
            shared
                .wheel
                .lock()
                .unwrap()
                .add(id, delay_secs, Box::new(task))
        });
    }

    /// Pushes timer `id`'s deadline out to a full delay from now.
    pub fn timer_refresh(&self, id: u64) {
        let shared = self.shared.clone();
        self.run_in_loop(move || shared.wheel.lock().unwrap().refresh(id));
    }

    /// Cancels timer `id`. The cancellation is a flag, observed when the
    /// entry expires.
    pub fn timer_cancel(&self, id: u64) {
        let shared = self.shared.clone();
        self.run_in_loop(move || shared.wheel.lock().unwrap().cancel(id));
    }

    /// Whether a live timer is enrolled under `id`.
    pub fn has_timer(&self, id: u64) -> bool {
        self.shared.wheel.lock().unwrap().has(id)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("owner", &*self.shared.owner.lock().unwrap())
            .finish()
    }
}

/// The loop itself: readiness poller, wake-up descriptor, task queue,
/// timer wheel and its 1s tick source. Owned by the thread that runs it.
pub struct EventLoop {
    poller: Poller,
    shared: Arc<LoopShared>,
    tick: TickSource,
}

impl EventLoop {
    /// Builds a loop plus its wake-up and tick descriptors. Kernel-primitive
    /// failures here are unrecoverable and abort the process.
    pub fn new() -> EventLoop {
        let poller = Poller::new();
        let registry = poller.registry();
        let waker = match Waker::new(&registry, WAKE_TOKEN) {
            Ok(waker) => waker,
            Err(err) => fatal("waker creation failed", &err),
        };
        let shared = Arc::new(LoopShared {
            registry,
            waker,
            owner: Mutex::new(thread::current().id()),
            quit: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            channels: Mutex::new(Slab::new()),
            wheel: Mutex::new(TimerWheel::new()),
        });
        let handle = LoopHandle {
            shared: shared.clone(),
        };
        let tick = TickSource::new(&handle);
        EventLoop {
            poller,
            shared,
            tick,
        }
    }

    /// A handle for posting work to this loop from anywhere.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs until [`LoopHandle::quit`]. Each iteration: block in the
    /// poller, dispatch every ready channel, then drain the task queue.
    /// Queued tasks therefore always observe the effects of the handlers
    /// from the same iteration.
    pub fn run(&mut self) {
        *self.shared.owner.lock().unwrap() = thread::current().id();
        self.shared.quit.store(false, Ordering::SeqCst);

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.shared.quit.load(Ordering::SeqCst) {
            active.clear();
            let channels = &self.shared.channels;
            self.poller.poll(|token, ready| {
                if token == WAKE_TOKEN {
                    // Queued tasks run below, after the ready channels.
                    return;
                }
                if let Some(channel) = channels.lock().unwrap().get(token.0) {
                    channel.set_revents(ready);
                    active.push(channel.clone());
                }
            });
            for channel in &active {
                channel.handle_event();
            }
            self.shared.run_pending();
        }
        self.shared.run_pending();
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("tick_fd", &self.tick.fd.as_raw_fd())
            .finish()
    }
}

/// The wheel's tick source: a monotonic 1s periodic timerfd whose read
/// callback drains the expiry counter and advances the wheel.
struct TickSource {
    fd: OwnedFd,
    channel: Arc<Channel>,
}

impl TickSource {
    fn new(lp: &LoopHandle) -> TickSource {
        let fd = create_timerfd();
        let raw = fd.as_raw_fd();
        let channel = Channel::new(lp, raw);
        let shared = Arc::downgrade(lp.shared());
        channel.set_read_callback(move || {
            if read_timerfd(raw) == 0 {
                return;
            }
            if let Some(shared) = Weak::upgrade(&shared) {
                shared.advance_wheel();
            }
        });
        channel.enable_read();
        TickSource { fd, channel }
    }
}

impl Drop for TickSource {
    fn drop(&mut self) {
        self.channel.remove();
    }
}

fn create_timerfd() -> OwnedFd {
    let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
    if fd < 0 {
        fatal("timerfd creation failed", &io::Error::last_os_error());
    }
    let second = libc::timespec {
        tv_sec: 1,
        tv_nsec: 0,
    };
    let period = libc::itimerspec {
        it_interval: second,
        it_value: second,
    };
    if unsafe { libc::timerfd_settime(fd, 0, &period, ptr::null_mut()) } < 0 {
        fatal("timerfd arm failed", &io::Error::last_os_error());
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn read_timerfd(fd: RawFd) -> u64 {
    let mut expirations: u64 = 0;
    let n = unsafe {
        libc::read(
            fd,
            &mut expirations as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ) {
            return 0;
        }
        fatal("timerfd read failed", &err);
    }
    expirations
}

#[cfg(test)]
mod test {
    use super::EventLoop;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_in_loop_is_synchronous_on_the_owner_thread() {
        let lp = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        lp.handle().run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn timer_fires_when_the_wheel_reaches_its_slot() {
        let lp = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        lp.handle()
            .timer_add(1, 1, move || {
                flag.fetch_add(1, Ordering::SeqCst);
            });
        assert!(lp.handle().has_timer(1));
        lp.shared.advance_wheel();
        assert_eq!(1, fired.load(Ordering::SeqCst));
        assert!(!lp.handle().has_timer(1));
    }

    #[test]
    fn canceled_timer_does_not_fire() {
        let lp = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = fired.clone();
        lp.handle().timer_add(9, 1, move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        lp.handle().timer_cancel(9);
        lp.shared.advance_wheel();
        assert_eq!(0, fired.load(Ordering::SeqCst));
    }
}
