//! Counting semaphore.
//!
//! The wait fast path is a lock-free conditional decrement; only a
//! contended wait takes the kernel lock to park. Release is ISR-safe and
//! cannot fail: the count increment is atomic and any wakeup is deferred
//! through the scheduler's event queue.

use core::sync::atomic::Ordering;

use super::SyncCore;
use crate::sched;

pub struct Semaphore {
    pub(crate) core: SyncCore,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            core: SyncCore::new(initial),
        }
    }

    /// Reset the count. Only meaningful while nothing is waiting.
    pub fn init(&self, value: u32) {
        self.core.value.store(value, Ordering::Release);
    }

    pub fn value(&self) -> u32 {
        self.core.value.load(Ordering::Acquire)
    }

    /// Take one unit if available. Never blocks; ISR-safe.
    pub fn try_take(&self) -> bool {
        self.core
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Take one unit, blocking until available.
    pub fn wait(&self) {
        loop {
            if self.try_take() {
                return;
            }
            self.core.block_current(None);
            sched::yield_now();
        }
    }

    /// Take one unit, blocking at most `ticks` ticks. A release that races
    /// the timeout wins: the unit is taken and `true` returned.
    pub fn wait_timeout(&self, ticks: u32) -> bool {
        loop {
            if self.try_take() {
                return true;
            }
            self.core.block_current(Some(ticks));
            sched::yield_now();
            if self.try_take() {
                return true;
            }
            if sched::take_timed_out() {
                return false;
            }
        }
    }

    /// Add one unit. ISR-safe; total (cannot fail).
    pub fn release(&self) {
        self.core.value.fetch_add(1, Ordering::AcqRel);
        self.core.post_release();
    }
}
