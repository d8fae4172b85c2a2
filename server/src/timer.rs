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

//! Hashed timer wheel

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Number of wheel slots; also the maximum representable delay in ticks.
pub(crate) const WHEEL_SLOTS: usize = 60;

type TimerFn = Box<dyn FnOnce() + Send>;

/// One scheduled task. Lives in exactly one wheel slot; the wheel's id map
/// holds a weak link for cancel/refresh lookups.
pub(crate) struct TimerEntry {
    id: u64,
    delay: u32,
    slot: AtomicUsize,
    canceled: AtomicBool,
    task: Mutex<Option<TimerFn>>,
}

impl TimerEntry {
    /// Runs the task unless the entry was canceled. Called by the loop once
    /// the entry's slot expires, outside the wheel lock.
    pub(crate) fn fire(&self) {
        if self.canceled.load(Ordering::Relaxed) {
            return;
        }
        if let Some(task) = self.task.lock().unwrap().take() {
            task();
        }
    }
}

/// Ring of [`WHEEL_SLOTS`] slots advanced once per second by the loop's tick
/// source. Schedule, cancel and refresh are all O(1) apart from the scan of
/// one slot's (short) vector on refresh.
///
/// All operations run on the owning loop; the public entry points on the
/// loop handle post here through the task queue.
pub(crate) struct TimerWheel {
    tick: usize,
    slots: Vec<Vec<Arc<TimerEntry>>>,
    timers: HashMap<u64, Weak<TimerEntry>>,
}

impl TimerWheel {
    pub(crate) fn new() -> TimerWheel {
        TimerWheel {
            tick: 0,
            slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
            timers: HashMap::new(),
        }
    }

    /// Schedules `task` to run after `delay` ticks, clamped to
    /// `[1, WHEEL_SLOTS]`. A duplicate id overwrites the map link; the
    /// previously enrolled entry still expires from its own slot.
    pub(crate) fn add(&mut self, id: u64, delay: u32, task: TimerFn) {
        let delay = delay.clamp(1, WHEEL_SLOTS as u32);
        let slot = (self.tick + delay as usize) % WHEEL_SLOTS;
        let entry = Arc::new(TimerEntry {
            id,
            delay,
            slot: AtomicUsize::new(slot),
            canceled: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        });
        self.timers.insert(id, Arc::downgrade(&entry));
        self.slots[slot].push(entry);
    }

    /// Pushes a live, uncanceled entry's deadline out to `now + delay` by
    /// moving it into the new slot (the old slot is erased, so the task
    /// fires exactly once, at the final deadline).
    pub(crate) fn refresh(&mut self, id: u64) {
        let Some(entry) = self.timers.get(&id).and_then(Weak::upgrade) else {
            return;
        };
        if entry.canceled.load(Ordering::Relaxed) {
            return;
        }
        let old = entry.slot.load(Ordering::Relaxed);
        if let Some(at) = self.slots[old].iter().position(|e| Arc::ptr_eq(e, &entry)) {
            self.slots[old].swap_remove(at);
        }
        let slot = (self.tick + entry.delay as usize) % WHEEL_SLOTS;
        entry.slot.store(slot, Ordering::Relaxed);
        self.slots[slot].push(entry);
    }

    /// Flags the entry canceled; observed when its slot expires.
    pub(crate) fn cancel(&mut self, id: u64) {
        if let Some(entry) = self.timers.get(&id).and_then(Weak::upgrade) {
            entry.canceled.store(true, Ordering::Relaxed);
        }
    }

    /// Whether a live entry is enrolled under `id`.
    pub(crate) fn has(&self, id: u64) -> bool {
        self.timers.get(&id).is_some_and(|w| w.strong_count() > 0)
    }

    /// Advances one tick and drains the slot the tick lands on. Map links
    /// owned by the drained entries are dropped here; the caller fires the
    /// returned entries outside the wheel lock.
    pub(crate) fn advance(&mut self) -> Vec<Arc<TimerEntry>> {
        self.tick = (self.tick + 1) % WHEEL_SLOTS;
        let expired = mem::take(&mut self.slots[self.tick]);
        for entry in &expired {
            let owns_link = self
                .timers
                .get(&entry.id)
                .is_some_and(|w| ptr::eq(w.as_ptr(), Arc::as_ptr(entry)));
            if owns_link {
                self.timers.remove(&entry.id);
            }
        }
        expired
    }
}

#[cfg(test)]
mod test {
    use super::{TimerWheel, WHEEL_SLOTS};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tick(wheel: &mut TimerWheel) {
        for entry in wheel.advance() {
            entry.fire();
        }
    }

    fn counter_task(count: &Arc<AtomicUsize>) -> Box<dyn FnOnce() + Send> {
        let count = count.clone();
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn task_fires_after_exactly_delay_ticks() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 3, counter_task(&count));
        tick(&mut wheel);
        tick(&mut wheel);
        assert_eq!(0, count.load(Ordering::SeqCst));
        tick(&mut wheel);
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(!wheel.has(1));
    }

    #[test]
    fn zero_delay_is_clamped_to_one_tick() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 0, counter_task(&count));
        tick(&mut wheel);
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn oversize_delay_is_clamped_to_wheel_capacity() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 10_000, counter_task(&count));
        for _ in 0..WHEEL_SLOTS - 1 {
            tick(&mut wheel);
        }
        assert_eq!(0, count.load(Ordering::SeqCst));
        tick(&mut wheel);
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn canceled_task_never_fires() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 2, counter_task(&count));
        wheel.cancel(1);
        for _ in 0..WHEEL_SLOTS {
            tick(&mut wheel);
        }
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn refresh_moves_the_deadline_and_fires_once() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 3, counter_task(&count));
        tick(&mut wheel);
        tick(&mut wheel);
        wheel.refresh(1);
        // The original deadline passes without firing.
        tick(&mut wheel);
        assert_eq!(0, count.load(Ordering::SeqCst));
        tick(&mut wheel);
        tick(&mut wheel);
        assert_eq!(1, count.load(Ordering::SeqCst));
        // No second firing a full rotation later.
        for _ in 0..WHEEL_SLOTS {
            tick(&mut wheel);
        }
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn refresh_after_expiry_is_a_no_op() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 1, counter_task(&count));
        tick(&mut wheel);
        assert_eq!(1, count.load(Ordering::SeqCst));
        wheel.refresh(1);
        for _ in 0..WHEEL_SLOTS {
            tick(&mut wheel);
        }
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn duplicate_id_overwrites_the_map_link() {
        let mut wheel = TimerWheel::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        wheel.add(1, 5, counter_task(&first));
        wheel.add(1, 2, counter_task(&second));
        // Cancel reaches the entry the map now points to.
        wheel.cancel(1);
        for _ in 0..WHEEL_SLOTS {
            tick(&mut wheel);
        }
        assert_eq!(0, second.load(Ordering::SeqCst));
        // The shadowed entry still expired from its own slot.
        assert_eq!(1, first.load(Ordering::SeqCst));
        assert!(!wheel.has(1));
    }

    #[test]
    fn has_reports_only_live_entries() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(!wheel.has(7));
        wheel.add(7, 2, counter_task(&count));
        assert!(wheel.has(7));
        tick(&mut wheel);
        tick(&mut wheel);
        assert!(!wheel.has(7));
    }
}
