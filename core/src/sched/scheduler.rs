//! The scheduling decision, taken inside the context-switch exception.
//!
//! [`scheduler_entry`] receives the outgoing thread's stack pointer (the
//! pre-emption artifact is intact on that stack) and returns the stack
//! pointer of the thread to resume. In order it:
//!
//! 1. snapshots the outgoing thread's errno into its record;
//! 2. recycles a `TimeToStop` thread into its termination handler;
//! 3. files a freshly-armed timeout into the sorted timer list (and takes
//!    a plain delayer off its run queue);
//! 4. drains the ISR event queue — each drained object wakes its
//!    highest-priority waiter to the *front* of that waiter's run queue;
//! 5. picks the head of the first non-empty run queue (idle if none),
//!    rotating the queue for round-robin when it has siblings;
//! 6. loads the incoming thread's errno and returns its stack pointer.

use ternos_abi::ThreadState;

use super::{KERNEL, KernelState, NUM_RUN_QUEUES, RUNNING, WaitLinks, run_enqueue_front, run_remove, thread, timer_list};
use crate::hooks::{self, KernelEvent};

/// Move every waiter owed to an ISR-originated release onto its run queue.
pub(crate) fn drain_event_queue(ks: &mut KernelState) {
    while let Some(core_ptr) = ks.event_queue.pop() {
        // SAFETY: a sync object stays alive while threads wait on it; the
        // event link guarantees this pointer was enqueued at most once.
        let core = unsafe { &*core_ptr };
        core.on_event_queue
            .store(false, core::sync::atomic::Ordering::Release);

        // SAFETY: kernel lock held.
        let mut pend = unsafe { core.pend.load() };
        let Some(waiter) = pend.head() else {
            continue;
        };
        pend.remove(&mut WaitLinks(&mut ks.threads), waiter);
        // SAFETY: kernel lock held.
        unsafe { core.pend.store(pend) };

        if ks.threads[waiter as usize].timer_link.is_linked() {
            timer_list::remove_thread(ks, waiter);
        }
        let t = &mut ks.threads[waiter as usize];
        debug_assert!(t.state.can_transition_to(ThreadState::Runnable));
        t.state = ThreadState::Runnable;
        t.wait_target = thread::WaitTarget::None;
        run_enqueue_front(ks, waiter);
    }
}

/// Head of the first non-empty run queue, rotated for round robin. Falls
/// back to the idle thread (whose queue is never empty once initialized).
pub(crate) fn pick_next(ks: &mut KernelState) -> u16 {
    let idle = ks.idle;
    let KernelState {
        threads,
        run_queues,
        ..
    } = ks;
    let arena = WaitLinks(threads);
    for pri in 0..NUM_RUN_QUEUES {
        if let Some(head) = run_queues[pri].head() {
            if run_queues[pri].len() > 1 {
                run_queues[pri].rotate(&arena);
            }
            debug_assert_eq!(arena.0[head as usize].state, ThreadState::Runnable);
            return head;
        }
    }
    idle
}

/// The scheduler proper. Called with the outgoing stack pointer from the
/// switch exception (or from host tests standing in for it); returns the
/// incoming stack pointer.
pub extern "C" fn scheduler_entry(sp: usize) -> usize {
    hooks::event(KernelEvent::SchedulerEntry);

    let out = {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let cur = ks.running;

        if (cur as usize) < ks.threads.len() {
            let ci = cur as usize;
            ks.threads[ci].sp = sp;
            ks.threads[ci].errno = super::errno();

            let state = ks.threads[ci].state;
            if state == ThreadState::TimeToStop {
                thread::recycle_into_term(ks, cur);
            } else if state.has_timeout() && !ks.threads[ci].timer_link.is_linked() {
                timer_list::insert_thread(ks, cur);
                if state == ThreadState::WaitForTick {
                    run_remove(ks, cur);
                }
            }
        }

        drain_event_queue(ks);

        let next = pick_next(ks);
        ks.running = next;
        RUNNING.store(next, core::sync::atomic::Ordering::Release);
        ks.switches = ks.switches.wrapping_add(1);
        super::set_errno(ks.threads[next as usize].errno);
        ks.threads[next as usize].sp
    };

    hooks::event(KernelEvent::SchedulerExit);
    out
}
