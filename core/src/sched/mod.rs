//! Kernel state, thread table, and the scheduling entry points.
//!
//! One lock — [`KERNEL`] — guards the whole scheduling domain: the thread
//! table, the per-priority run queues, the software-timer arena, the merged
//! timer list, and the ISR event queue. The lock disables interrupts while
//! held and is never held across a suspension point.
//!
//! Pend queues of mutexes, semaphores and signals physically live inside
//! those objects, but their link storage is the thread table, so they are
//! mutated under the same kernel lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, Ordering};

use ternos_abi::{
    INVALID_THREAD_ID, MAX_PRIORITIES, MAX_THREADS, MAX_TIMERS, ThreadId, ThreadState,
};
use ternos_lib::list::{IndexList, Link, LinkArena};
use ternos_lib::{IrqMutex, cpu};

use crate::arch;
use crate::hooks::{self, KernelEvent};
use crate::sync::SyncCore;

pub(crate) mod idle;
pub(crate) mod scheduler;
pub(crate) mod timer_list;
pub mod thread;


#[cfg(test)]
mod tests;

pub use scheduler::scheduler_entry;
pub use thread::{
    StaticStack, thread_create, thread_exit, thread_get_effective_priority, thread_get_priority,
    thread_get_state, thread_kill, thread_name, thread_set_priority, thread_set_stack,
    thread_set_term_handler, thread_set_user_data, thread_spawn, thread_stack_size,
    thread_stack_usage, thread_start, thread_user_data, thread_wait_for_stop,
    thread_wait_for_stop_timeout,
};

use thread::Thread;
use timer_list::TimerSlot;

/// Run queues: one per application priority plus the idle slot.
pub(crate) const NUM_RUN_QUEUES: usize = MAX_PRIORITIES + 1;

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

pub(crate) struct KernelState {
    pub threads: [Thread; MAX_THREADS],
    pub run_queues: [IndexList; NUM_RUN_QUEUES],
    pub timers: [TimerSlot; MAX_TIMERS],
    /// Merged, sorted-by-wake-tick list of thread timeouts and timers.
    pub timer_list: IndexList,
    pub event_queue: EventQueue,
    pub tick: u64,
    pub running: u16,
    pub idle: u16,
    pub switches: u32,
}

// SAFETY: the raw pointers inside Thread (stack base, wait targets) are
// only dereferenced under the kernel lock or by the owning thread.
unsafe impl Send for KernelState {}

impl KernelState {
    const fn new() -> Self {
        const THREAD: Thread = Thread::empty();
        const SLOT: TimerSlot = TimerSlot::empty();
        const LIST: IndexList = IndexList::new();
        Self {
            threads: [THREAD; MAX_THREADS],
            run_queues: [LIST; NUM_RUN_QUEUES],
            timers: [SLOT; MAX_TIMERS],
            timer_list: IndexList::new(),
            event_queue: EventQueue::new(),
            tick: 0,
            running: INVALID_THREAD_ID,
            idle: INVALID_THREAD_ID,
            switches: 0,
        }
    }
}

pub(crate) static KERNEL: IrqMutex<KernelState> = IrqMutex::new(KernelState::new());

/// Mirror of `KernelState::running` readable without the lock (the mutex
/// fast path and `current_thread` use it).
pub(crate) static RUNNING: AtomicU16 = AtomicU16::new(INVALID_THREAD_ID);

static STARTED: AtomicBool = AtomicBool::new(false);

/// Thread-local errno of the running thread; swapped by the scheduler.
static ERRNO: AtomicI32 = AtomicI32::new(0);

static CYCLES_PER_TICK: AtomicU32 = AtomicU32::new(48_000);
static CYCLES_PER_US: AtomicU32 = AtomicU32::new(48);

// ---------------------------------------------------------------------------
// ISR event queue
// ---------------------------------------------------------------------------

/// Scheduler-owned queue of synchronization objects with an ISR-originated
/// release and live waiters. Capacity matches the thread table: each
/// distinct object on the queue has at least one distinct waiter.
pub(crate) struct EventQueue {
    items: [*const SyncCore; MAX_THREADS],
    head: usize,
    len: usize,
}

impl EventQueue {
    const fn new() -> Self {
        Self {
            items: [core::ptr::null(); MAX_THREADS],
            head: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, core: *const SyncCore) -> bool {
        if self.len == self.items.len() {
            return false;
        }
        self.items[(self.head + self.len) % self.items.len()] = core;
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<*const SyncCore> {
        if self.len == 0 {
            return None;
        }
        let core = self.items[self.head];
        self.head = (self.head + 1) % self.items.len();
        self.len -= 1;
        Some(core)
    }
}

// ---------------------------------------------------------------------------
// Thread-table link plumbing
// ---------------------------------------------------------------------------

/// `LinkArena` view of the thread table's wait links (run queues, pend
/// queues, and stop queues all share this link; a thread is on at most one
/// of those at a time).
pub(crate) struct WaitLinks<'a>(pub &'a mut [Thread; MAX_THREADS]);

impl LinkArena for WaitLinks<'_> {
    fn link(&self, idx: u16) -> Link {
        self.0[idx as usize].wait_link
    }
    fn set_link(&mut self, idx: u16, link: Link) {
        self.0[idx as usize].wait_link = link;
    }
}

/// Insert `tid` into a pend queue ordered by effective priority, FIFO
/// within a priority.
pub(crate) fn pend_insert(threads: &mut [Thread; MAX_THREADS], list: &mut IndexList, tid: u16) {
    let pri = threads[tid as usize].effective_pri;
    let mut arena = WaitLinks(threads);
    let mut at = None;
    for node in list.iter(&arena) {
        if arena.0[node as usize].effective_pri > pri {
            at = Some(node);
            break;
        }
    }
    match at {
        Some(node) => list.insert_before(&mut arena, node, tid),
        None => list.push_back(&mut arena, tid),
    }
}

pub(crate) fn run_enqueue_back(ks: &mut KernelState, tid: u16) {
    let pri = ks.threads[tid as usize].effective_pri as usize;
    let KernelState {
        threads,
        run_queues,
        ..
    } = ks;
    run_queues[pri].push_back(&mut WaitLinks(threads), tid);
}

pub(crate) fn run_enqueue_front(ks: &mut KernelState, tid: u16) {
    let pri = ks.threads[tid as usize].effective_pri as usize;
    let KernelState {
        threads,
        run_queues,
        ..
    } = ks;
    run_queues[pri].push_front(&mut WaitLinks(threads), tid);
}

/// Detach `tid` from whichever run queue holds it (looked up by scanning:
/// the thread may sit on a stale-priority queue mid-update).
pub(crate) fn run_remove(ks: &mut KernelState, tid: u16) {
    if !ks.threads[tid as usize].wait_link.is_linked() {
        return;
    }
    let KernelState {
        threads,
        run_queues,
        ..
    } = ks;
    let mut arena = WaitLinks(threads);
    // The effective priority is almost always current; verify membership
    // before unlinking, falling back to a scan.
    let pri = arena.0[tid as usize].effective_pri as usize;
    if run_queues[pri].iter(&arena).any(|n| n == tid) {
        run_queues[pri].remove(&mut arena, tid);
        return;
    }
    for queue in run_queues.iter_mut() {
        if queue.iter(&arena).any(|n| n == tid) {
            queue.remove(&mut arena, tid);
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Reset the kernel and create the idle thread. Call once at boot, before
/// any thread or synchronization object is used.
pub fn kernel_init() {
    {
        let mut k = KERNEL.lock();
        *k = KernelState::new();
        let idle = thread::create_idle(&mut *k);
        k.idle = idle;
        k.running = idle;
        RUNNING.store(idle, Ordering::Release);
    }
    STARTED.store(false, Ordering::Release);
    ERRNO.store(0, Ordering::Relaxed);
}

/// Configure the core clock so ticks and microsecond delays can be derived
/// from the cycle counter. Call before `kernel_start`.
pub fn kernel_set_clock(cycles_per_tick: u32, cycles_per_us: u32) {
    CYCLES_PER_TICK.store(cycles_per_tick.max(1), Ordering::Relaxed);
    CYCLES_PER_US.store(cycles_per_us.max(1), Ordering::Relaxed);
}

pub fn clock_cycles_per_tick() -> u32 {
    CYCLES_PER_TICK.load(Ordering::Relaxed)
}

pub(crate) fn clock_cycles_per_us() -> u32 {
    CYCLES_PER_US.load(Ordering::Relaxed)
}

/// Hand control to the scheduler. The board must have configured clocks
/// and created at least one thread. Does not return.
pub fn kernel_start() -> ! {
    arch::port_init();
    let first_sp = {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let first = scheduler::pick_next(ks);
        ks.running = first;
        RUNNING.store(first, Ordering::Release);
        ks.threads[first as usize].sp
    };
    STARTED.store(true, Ordering::Release);
    arch::start_first_thread(first_sp)
}

pub fn is_started() -> bool {
    STARTED.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// System tick handler body: advance time by one tick and reschedule.
/// Invoked by the port's tick vector.
pub fn kernel_tick() {
    hooks::event(KernelEvent::Tick);
    advance_tick_count(1);
    request_switch();
}

/// Advance kernel time by `ticks` and run every expiry that became due.
/// This is also the reconciliation entry used by tickless idle.
pub fn advance_tick_count(ticks: u64) {
    let fired = {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        ks.tick = ks.tick.wrapping_add(ticks);
        timer_list::advance(ks)
    };
    timer_list::dispatch(&fired);
}

pub fn tick_count() -> u64 {
    KERNEL.lock().tick
}

pub fn cycle_count() -> u32 {
    cpu::cycle_count()
}

/// Busy-wait for `us` microseconds against the cycle counter.
pub fn delay_microseconds(us: u32) {
    let cycles = us.saturating_mul(clock_cycles_per_us());
    let start = cpu::cycle_count();
    while cpu::cycle_count().wrapping_sub(start) < cycles {
        cpu::spin_hint();
    }
}

/// Put the running thread to sleep for `ticks` ticks.
pub fn delay(ticks: u32) {
    if ticks == 0 {
        yield_now();
        return;
    }
    {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        if ks.running == INVALID_THREAD_ID {
            return;
        }
        let tid = ks.running as usize;
        ks.threads[tid].wake_tick = ks.tick.wrapping_add(ticks as u64);
        ks.threads[tid].timed_out = false;
        ks.threads[tid].wait_target = thread::WaitTarget::None;
        ks.threads[tid].state = ThreadState::WaitForTick;
        // The scheduler removes us from the run queue and files the
        // timeout when the switch is taken.
    }
    yield_now();
}

// ---------------------------------------------------------------------------
// Small per-thread accessors
// ---------------------------------------------------------------------------

pub fn current_thread() -> ThreadId {
    RUNNING.load(Ordering::Acquire)
}

pub fn errno() -> i32 {
    ERRNO.load(Ordering::Relaxed)
}

pub fn set_errno(value: i32) {
    ERRNO.store(value, Ordering::Relaxed);
}

/// Give up the CPU; same-priority peers get their round-robin turn.
pub fn yield_now() {
    request_switch();
}

/// Pend the switch exception — but never before the scheduler owns the
/// CPU, since the exception would unwind a process stack that does not
/// exist yet.
pub(crate) fn request_switch() {
    if is_started() {
        arch::pend_context_switch();
    }
}

/// Consume the running thread's timed-out flag.
pub(crate) fn take_timed_out() -> bool {
    let mut k = KERNEL.lock();
    let tid = k.running;
    if tid == INVALID_THREAD_ID {
        return false;
    }
    let flag = k.threads[tid as usize].timed_out;
    k.threads[tid as usize].timed_out = false;
    flag
}

/// Force the running thread onto its termination path (failed assertions
/// and thread-context faults end up here).
pub(crate) fn terminate_running_thread() {
    {
        let mut k = KERNEL.lock();
        let tid = k.running;
        if tid == INVALID_THREAD_ID {
            return;
        }
        k.threads[tid as usize].state = ThreadState::TimeToStop;
    }
    request_switch();
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct KernelStats {
    pub ticks: u64,
    pub context_switches: u32,
    pub threads_live: u32,
    pub timers_armed: u32,
}

pub fn kernel_stats() -> KernelStats {
    let k = KERNEL.lock();
    let threads_live = k
        .threads
        .iter()
        .filter(|t| !matches!(t.state, ThreadState::Uninit | ThreadState::Stopped))
        .count() as u32;
    let timers_armed = k.timers.iter().filter(|t| t.active).count() as u32;
    KernelStats {
        ticks: k.tick,
        context_switches: k.switches,
        threads_live,
        timers_armed,
    }
}

pub(crate) use thread::WaitTarget;

/// A synchronization object's queue of waiting threads. Lives inside the
/// object, but its link storage is the thread table, so every access
/// happens with the kernel locked.
pub(crate) struct PendQueue(UnsafeCell<IndexList>);

// SAFETY: pend queues are only touched while holding the kernel lock.
unsafe impl Send for PendQueue {}
unsafe impl Sync for PendQueue {}

impl PendQueue {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(IndexList::new()))
    }

    /// Copy the list out for mutation; write the result back with
    /// [`PendQueue::store`].
    ///
    /// # Safety
    /// Caller must hold the kernel lock.
    pub unsafe fn load(&self) -> IndexList {
        unsafe { *self.0.get() }
    }

    /// # Safety
    /// Caller must hold the kernel lock and store a list whose nodes are
    /// exactly the threads blocked on this object.
    pub unsafe fn store(&self, list: IndexList) {
        unsafe { *self.0.get() = list }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::boxed::Box;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use std::vec;

    static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    /// Serialize kernel-global tests and hand back a freshly-reset kernel.
    pub fn kernel_fixture() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        kernel_init();
        crate::arch::clear_switch_requests();
        guard
    }

    pub fn leak_stack(size: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; size].into_boxed_slice())
    }

    pub fn noop_entry(_arg: usize) -> i32 {
        0
    }

    /// Create and start a thread that never actually executes on the host.
    pub fn spawn(name: &'static str, pri: u8) -> ThreadId {
        thread::thread_spawn(name, noop_entry, 0, pri, leak_stack(512)).expect("spawn")
    }

    /// Pretend `tid` is the one executing (tests act on behalf of threads).
    pub fn set_running(tid: ThreadId) {
        let mut k = KERNEL.lock();
        k.running = tid;
        RUNNING.store(tid, Ordering::Release);
    }

    pub fn thread_state(tid: ThreadId) -> ThreadState {
        KERNEL.lock().threads[tid as usize].state
    }

    pub fn timed_out(tid: ThreadId) -> bool {
        KERNEL.lock().threads[tid as usize].timed_out
    }
}
