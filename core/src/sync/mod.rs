//! Synchronization primitives: recursive mutex with priority inheritance,
//! counting semaphore, 32-bit signal, software timer, and the blocking
//! queue built on top of two semaphores.
//!
//! Semaphores and signals share one representation ([`SyncCore`]): an
//! atomic 32-bit value (count or bitset), a priority-ordered pend queue,
//! and an **event link** marking membership on the scheduler's ISR event
//! queue. Releases are ISR-safe and total: the atomic update happens
//! immediately, and if waiters exist the object is queued (at most once
//! per release burst) for the scheduler to drain — the runnable set is
//! only ever mutated inside the scheduler.

pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod signal;
pub mod timer;

#[cfg(test)]
mod tests;

pub use mutex::Mutex;
pub use queue::{Queue, QueueGroup, QueueU32};
pub use semaphore::Semaphore;
pub use signal::{Signal, clear_channel, next_channel};
pub use timer::{Timer, TimerCallback};

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ternos_abi::{INVALID_THREAD_ID, ThreadState};

use crate::sched::{KERNEL, PendQueue, WaitTarget, pend_insert, run_remove};

/// Shared machinery of the counting semaphore and the signal.
pub(crate) struct SyncCore {
    /// Count (semaphore) or flag bitset (signal).
    pub value: AtomicU32,
    /// Set ⇔ this object is on the ISR event queue. Guarantees at most
    /// one enqueue per release burst.
    pub on_event_queue: AtomicBool,
    pub pend: PendQueue,
}

impl SyncCore {
    pub(crate) const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            on_event_queue: AtomicBool::new(false),
            pend: PendQueue::new(),
        }
    }

    /// The ISR-safe release tail: if any thread is waiting and the event
    /// link is clear, queue this object for the scheduler's drain; request
    /// a switch when the head waiter outranks the running thread.
    pub(crate) fn post_release(&self) {
        let preempt;
        {
            let mut k = KERNEL.lock();
            let ks = &mut *k;
            // SAFETY: kernel lock held.
            let pend = unsafe { self.pend.load() };
            let Some(first) = pend.head() else {
                return;
            };
            if !self.on_event_queue.swap(true, Ordering::AcqRel) {
                let queued = ks.event_queue.push(self as *const SyncCore);
                debug_assert!(queued);
            }
            let run = ks.running;
            preempt = run != INVALID_THREAD_ID
                && ks.threads[first as usize].effective_pri
                    < ks.threads[run as usize].effective_pri;
        }
        if preempt {
            crate::sched::request_switch();
        }
    }

    /// Park the running thread on this object's pend queue (priority
    /// order). Re-checks the value under the lock so a release that
    /// slipped in after the caller's failed fast path is not lost.
    pub(crate) fn block_current(&self, timeout: Option<u32>) {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        if self.value.load(Ordering::Acquire) != 0 {
            return;
        }
        let tid = ks.running;
        if tid == INVALID_THREAD_ID {
            return;
        }
        let ti = tid as usize;
        if ks.threads[ti].state != ThreadState::Runnable {
            // Already parked (hosted tests re-enter the wait loop).
            return;
        }
        run_remove(ks, tid);
        ks.threads[ti].timed_out = false;
        ks.threads[ti].wait_target = WaitTarget::Sync(self as *const SyncCore);
        let next = match timeout {
            Some(ticks) => {
                ks.threads[ti].wake_tick = ks.tick.wrapping_add(ticks as u64);
                ThreadState::WaitForSemOrTick
            }
            None => ThreadState::WaitForSem,
        };
        debug_assert!(ks.threads[ti].state.can_transition_to(next));
        ks.threads[ti].state = next;
        // SAFETY: kernel lock held.
        let mut pend = unsafe { self.pend.load() };
        pend_insert(&mut ks.threads, &mut pend, tid);
        // SAFETY: kernel lock held.
        unsafe { self.pend.store(pend) };
    }
}
