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

//! Dedicated thread per loop, and the worker pool dispatching over them

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::warn;

use crate::event_loop::{EventLoop, LoopHandle};

/// A thread whose whole body is one [`EventLoop`]: the loop is built on the
/// thread's own stack, its handle is published back, and the thread blocks
/// in the loop until quit.
pub struct LoopThread {
    thread: Option<JoinHandle<()>>,
    rx: Mutex<Option<mpsc::Receiver<LoopHandle>>>,
    handle: Mutex<Option<LoopHandle>>,
}

impl LoopThread {
    /// Spawns the thread and starts its loop.
    pub fn new() -> LoopThread {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("virvel-loop".into())
            .spawn(move || {
                let mut lp = EventLoop::new();
                // The receiver may be gone if the owner was dropped early.
                let _ = tx.send(lp.handle());
                lp.run();
            })
            .expect("loop thread spawn failed");
        LoopThread {
            thread: Some(thread),
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    /// Blocks until the loop's handle is published, or returns `None` when
    /// the thread stopped before publishing one.
    pub fn handle(&self) -> Option<LoopHandle> {
        let mut cached = self.handle.lock().unwrap();
        if cached.is_none() {
            if let Some(rx) = self.rx.lock().unwrap().take() {
                match rx.recv() {
                    Ok(handle) => *cached = Some(handle),
                    Err(_) => warn!("loop thread stopped before publishing its handle"),
                }
            }
        }
        cached.clone()
    }

    /// Quits the loop and joins the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Default for LoopThread {
    fn default() -> LoopThread {
        LoopThread::new()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopThread")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

/// Per-loop initialization callback run on each worker as it starts.
pub type LoopInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Fixed pool of worker loop threads anchored at a base loop.
///
/// With zero workers everything lands on the base loop; otherwise
/// [`LoopThreadPool::next_loop`] hands out workers round-robin and
/// [`LoopThreadPool::loop_for_hash`] gives session-sticky placement.
pub struct LoopThreadPool {
    base: LoopHandle,
    count: AtomicUsize,
    started: AtomicBool,
    next: AtomicUsize,
    workers: Mutex<Vec<LoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
    init: Mutex<Option<LoopInitCallback>>,
    stop_lock: Mutex<()>,
}

impl LoopThreadPool {
    /// Creates an empty pool anchored at `base`.
    pub fn new(base: LoopHandle) -> LoopThreadPool {
        LoopThreadPool {
            base,
            count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
            init: Mutex::new(None),
            stop_lock: Mutex::new(()),
        }
    }

    /// Sets the number of worker threads. Ignored once started.
    pub fn set_thread_count(&self, count: usize) {
        if !self.started.load(Ordering::SeqCst) {
            self.count.store(count, Ordering::SeqCst);
        }
    }

    /// Installs a callback run once on every loop as it starts.
    pub fn set_init_callback(&self, f: impl Fn(&LoopHandle) + Send + Sync + 'static) {
        *self.init.lock().unwrap() = Some(Arc::new(f));
    }

    /// The number of worker loops.
    pub fn size(&self) -> usize {
        self.loops.lock().unwrap().len()
    }

    /// Spawns all workers and blocks until each loop is ready. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let init = self.init.lock().unwrap().clone();
        let count = self.count.load(Ordering::SeqCst);
        let mut workers = Vec::with_capacity(count);
        let mut loops = Vec::with_capacity(count);
        for _ in 0..count {
            let worker = LoopThread::new();
            if let Some(handle) = worker.handle() {
                if let Some(init) = &init {
                    let cb = init.clone();
                    let lp = handle.clone();
                    handle.run_in_loop(move || cb(&lp));
                }
                loops.push(handle);
            }
            workers.push(worker);
        }
        if count == 0 {
            if let Some(init) = &init {
                let cb = init.clone();
                let lp = self.base.clone();
                self.base.run_in_loop(move || cb(&lp));
            }
        }
        *self.workers.lock().unwrap() = workers;
        *self.loops.lock().unwrap() = loops;
    }

    /// The next worker loop, round-robin; the base loop when the pool has
    /// no workers.
    pub fn next_loop(&self) -> LoopHandle {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base.clone();
        }
        let at = self.next.fetch_add(1, Ordering::Relaxed);
        loops[at % loops.len()].clone()
    }

    /// A sticky worker loop for `hash`; the base loop when the pool has no
    /// workers.
    pub fn loop_for_hash(&self, hash: usize) -> LoopHandle {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base.clone();
        }
        loops[hash % loops.len()].clone()
    }

    /// Quits and joins every worker. Idempotent and serialized.
    pub fn stop(&self) {
        let _guard = self.stop_lock.lock().unwrap();
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.loops.lock().unwrap().clear();
        for mut worker in self.workers.lock().unwrap().drain(..) {
            worker.stop();
        }
        self.next.store(0, Ordering::Relaxed);
    }
}

impl Drop for LoopThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LoopThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopThreadPool")
            .field("workers", &self.size())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}
