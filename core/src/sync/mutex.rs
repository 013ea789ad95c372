//! Recursive mutex with single-level priority inheritance.
//!
//! The uncontended lock is one compare-and-swap of the owner word; only
//! contention takes the kernel lock. While a higher-priority thread waits,
//! the owner's effective priority is raised to the waiter's (one level —
//! the raise does not propagate across a chain of mutexes), bounding
//! priority inversion. Unlock hands the mutex to nobody: the head waiter
//! is made runnable at the front of its run queue and re-competes, which
//! keeps the fast path free of handoff bookkeeping.
//!
//! Mutexes are thread-context only. Unlocking a mutex you do not own is a
//! programmer error and trips a kernel assertion.

use core::cell::Cell;
use core::sync::atomic::{AtomicU16, Ordering};

use ternos_abi::{INVALID_THREAD_ID, ThreadState};

use crate::sched::{
    self, KERNEL, PendQueue, WaitLinks, WaitTarget, pend_insert, run_enqueue_back,
    run_enqueue_front, run_remove,
};

pub struct Mutex {
    owner: AtomicU16,
    /// Recursion depth; touched only by the owner.
    depth: Cell<u32>,
    pub(crate) pend: PendQueue,
}

// SAFETY: `depth` is only accessed by the owning thread (single core), and
// the pend queue only under the kernel lock.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU16::new(INVALID_THREAD_ID),
            depth: Cell::new(0),
            pend: PendQueue::new(),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.owner.load(Ordering::Acquire) == sched::current_thread()
    }

    /// Acquire without blocking. Recursive acquisition always succeeds.
    pub fn try_lock(&self) -> bool {
        let tid = sched::current_thread();
        if tid == INVALID_THREAD_ID {
            return false;
        }
        if self.owner.load(Ordering::Acquire) == tid {
            self.depth.set(self.depth.get() + 1);
            return true;
        }
        if self
            .owner
            .compare_exchange(INVALID_THREAD_ID, tid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.depth.set(1);
            return true;
        }
        false
    }

    /// Acquire, blocking while another thread owns the mutex.
    pub fn lock(&self) {
        let tid = sched::current_thread();
        crate::kassert!(tid != INVALID_THREAD_ID, "mutex lock outside thread context");
        if tid == INVALID_THREAD_ID {
            return;
        }
        if self.owner.load(Ordering::Acquire) == tid {
            self.depth.set(self.depth.get() + 1);
            return;
        }
        loop {
            if self
                .owner
                .compare_exchange(INVALID_THREAD_ID, tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.depth.set(1);
                return;
            }
            if self.block_on(tid) {
                sched::yield_now();
            }
        }
    }

    /// Park `tid` on the pend queue and apply priority inheritance.
    /// Returns false when the owner vanished first (retry the fast path).
    pub(crate) fn block_on(&self, tid: u16) -> bool {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let owner = self.owner.load(Ordering::Acquire);
        if owner == INVALID_THREAD_ID {
            return false;
        }
        let ti = tid as usize;
        if ks.threads[ti].state != ThreadState::Runnable {
            // Already parked (hosted tests re-enter the lock loop).
            return true;
        }
        run_remove(ks, tid);
        ks.threads[ti].timed_out = false;
        ks.threads[ti].wait_target = WaitTarget::Mutex(self as *const Mutex);
        ks.threads[ti].state = ThreadState::WaitForMutex;
        // SAFETY: kernel lock held.
        let mut pend = unsafe { self.pend.load() };
        pend_insert(&mut ks.threads, &mut pend, tid);
        // SAFETY: kernel lock held.
        unsafe { self.pend.store(pend) };

        // Single-level priority inheritance: raise the direct owner to the
        // waiter's level and move it to the front of its (new) run queue.
        let waiter_pri = ks.threads[ti].effective_pri;
        let oi = owner as usize;
        if waiter_pri < ks.threads[oi].effective_pri {
            if ks.threads[oi].state == ThreadState::Runnable {
                run_remove(ks, owner);
                ks.threads[oi].effective_pri = waiter_pri;
                run_enqueue_front(ks, owner);
            } else {
                ks.threads[oi].effective_pri = waiter_pri;
            }
        }
        true
    }

    /// Release one level of recursion; at depth zero the mutex is freed
    /// and the head waiter (if any) made runnable.
    pub fn unlock(&self) {
        let tid = sched::current_thread();
        if self.owner.load(Ordering::Acquire) != tid {
            crate::kassert!(false, "mutex unlock by non-owner");
            return;
        }
        let depth = self.depth.get();
        if depth > 1 {
            self.depth.set(depth - 1);
            return;
        }
        self.depth.set(0);
        self.owner.store(INVALID_THREAD_ID, Ordering::Release);

        let preempt;
        {
            let mut k = KERNEL.lock();
            let ks = &mut *k;
            let ci = tid as usize;

            // Drop any inherited raise back to nominal.
            if ks.threads[ci].effective_pri != ks.threads[ci].nominal_pri {
                if ks.threads[ci].state == ThreadState::Runnable {
                    run_remove(ks, tid);
                    ks.threads[ci].effective_pri = ks.threads[ci].nominal_pri;
                    run_enqueue_back(ks, tid);
                } else {
                    ks.threads[ci].effective_pri = ks.threads[ci].nominal_pri;
                }
            }

            // SAFETY: kernel lock held.
            let mut pend = unsafe { self.pend.load() };
            let Some(waiter) = pend.head() else {
                // SAFETY: kernel lock held.
                unsafe { self.pend.store(pend) };
                return;
            };
            pend.remove(&mut WaitLinks(&mut ks.threads), waiter);
            // SAFETY: kernel lock held.
            unsafe { self.pend.store(pend) };

            if ks.threads[waiter as usize].timer_link.is_linked() {
                crate::sched::timer_list::remove_thread(ks, waiter);
            }
            let w = &mut ks.threads[waiter as usize];
            w.state = ThreadState::Runnable;
            w.wait_target = WaitTarget::None;
            run_enqueue_front(ks, waiter);

            preempt = ks.threads[waiter as usize].effective_pri < ks.threads[ci].effective_pri;
        }
        if preempt {
            sched::yield_now();
        }
    }

    /// Release the mutex entirely if the caller owns it, regardless of
    /// recursion depth. For cleanup paths (termination handlers).
    pub fn restore(&self) {
        if self.is_owner() {
            self.depth.set(1);
            self.unlock();
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
