//! Thread records and lifecycle.
//!
//! Threads live in a fixed arena ([`super::KernelState::threads`]) and are
//! addressed by index. Each record embeds two link fields: `wait_link`
//! (membership in exactly one of: a run queue, a pend queue, a stop queue)
//! and `timer_link` (membership in the merged timer list while a timeout is
//! armed). The invariants:
//!
//! - `Runnable` ⇔ on exactly one run queue at the effective priority
//!   (including the running thread);
//! - any `WaitFor*` ⇔ on the pend queue of the object in `wait_target`;
//! - any state with a timeout ⇔ on the timer list.
//!
//! A fresh stack is filled with [`STACK_FILL_BYTE`] and topped with a
//! synthetic exception frame that resumes in [`thread_trampoline`]; a
//! thread returning from its entry falls into [`thread_exit`], which
//! records the stop value and releases every joiner.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use ternos_abi::{
    IDLE_PRIORITY, INVALID_THREAD_ID, MAX_PRIORITIES, MAX_THREADS, MIN_STACK_SIZE,
    STACK_FILL_BYTE, ThreadEntry, ThreadId, ThreadState,
};
use ternos_lib::list::{IndexList, Link};

use super::{KERNEL, KernelState, WaitLinks, pend_insert, run_enqueue_back, run_remove};
use crate::arch;
use crate::sched::{idle, timer_list};
use crate::sync::SyncCore;
use crate::sync::mutex::Mutex;

/// What a blocked thread is blocked on; tells timeouts and kills which
/// pend queue to unhook from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    None,
    Sync(*const SyncCore),
    Mutex(*const Mutex),
    Stop(u16),
}

pub(crate) struct Thread {
    pub state: ThreadState,
    pub nominal_pri: u8,
    pub effective_pri: u8,
    pub wait_link: Link,
    pub timer_link: Link,
    /// Threads waiting for this one to stop.
    pub stop_queue: IndexList,
    pub wait_target: WaitTarget,
    pub wake_tick: u64,
    pub timed_out: bool,
    pub sp: usize,
    pub errno: i32,
    pub stop_value: i32,
    pub entry: Option<ThreadEntry>,
    pub arg: usize,
    pub term_entry: Option<ThreadEntry>,
    pub term_arg: usize,
    pub stack_base: *mut u8,
    pub stack_size: usize,
    pub name: &'static str,
    pub user_data: usize,
}

impl Thread {
    pub(crate) const fn empty() -> Self {
        Self {
            state: ThreadState::Uninit,
            nominal_pri: 0,
            effective_pri: 0,
            wait_link: Link::detached(),
            timer_link: Link::detached(),
            stop_queue: IndexList::new(),
            wait_target: WaitTarget::None,
            wake_tick: 0,
            timed_out: false,
            sp: 0,
            errno: 0,
            stop_value: 0,
            entry: None,
            arg: 0,
            term_entry: None,
            term_arg: 0,
            stack_base: core::ptr::null_mut(),
            stack_size: 0,
            name: "",
            user_data: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Static stacks
// ---------------------------------------------------------------------------

/// A statically-allocated thread stack.
///
/// ```ignore
/// static WORKER_STACK: StaticStack<2048> = StaticStack::new();
/// thread_spawn("worker", worker, 0, 2, WORKER_STACK.take().unwrap());
/// ```
pub struct StaticStack<const N: usize> {
    mem: UnsafeCell<[u8; N]>,
    taken: AtomicBool,
}

// SAFETY: `take` hands the buffer out exactly once.
unsafe impl<const N: usize> Sync for StaticStack<N> {}

impl<const N: usize> StaticStack<N> {
    pub const fn new() -> Self {
        Self {
            mem: UnsafeCell::new([0; N]),
            taken: AtomicBool::new(false),
        }
    }

    /// Claim the stack. Returns `None` on the second and later calls.
    pub fn take(&'static self) -> Option<&'static mut [u8]> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: the flag guarantees a single exclusive hand-out.
        Some(unsafe { &mut (&mut *self.mem.get())[..] })
    }

    /// Re-borrow regardless of the taken flag.
    ///
    /// # Safety
    /// Only for re-initialization paths that rebuild the owning thread
    /// (the kernel's idle stack across `kernel_init` calls).
    pub(crate) unsafe fn raw(&'static self) -> &'static mut [u8] {
        unsafe { &mut (&mut *self.mem.get())[..] }
    }
}

const IDLE_STACK_SIZE: usize = 1024;

// ---------------------------------------------------------------------------
// Entry plumbing
// ---------------------------------------------------------------------------

extern "C" fn thread_trampoline(tid: usize) -> ! {
    let (entry, arg) = {
        let k = KERNEL.lock();
        let t = &k.threads[tid];
        (t.entry, t.arg)
    };
    let code = match entry {
        Some(f) => f(arg),
        // A slot recycled with no termination handler stops with its
        // argument as the stop value.
        None => arg as i32,
    };
    thread_exit(code)
}

extern "C" fn thread_return_guard() -> ! {
    crate::kassert!(false, "thread resumed past its exit frame");
    loop {
        arch::wait_for_event();
    }
}

fn entry_fns() -> (usize, usize) {
    let tramp: extern "C" fn(usize) -> ! = thread_trampoline;
    let guard: extern "C" fn() -> ! = thread_return_guard;
    (tramp as usize, guard as usize)
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

fn alloc_slot(ks: &KernelState) -> Option<u16> {
    ks.threads
        .iter()
        .position(|t| matches!(t.state, ThreadState::Uninit | ThreadState::Stopped))
        .map(|i| i as u16)
}

fn init_thread_slot(
    ks: &mut KernelState,
    tid: u16,
    name: &'static str,
    entry: ThreadEntry,
    arg: usize,
    priority: u8,
    stack: &'static mut [u8],
) {
    let base = stack.as_mut_ptr();
    let size = stack.len();
    stack.fill(STACK_FILL_BYTE);
    let (tramp, guard) = entry_fns();
    let sp = arch::init_stack(stack, tramp, guard, tid as usize);

    let t = &mut ks.threads[tid as usize];
    *t = Thread::empty();
    t.state = ThreadState::Init;
    t.nominal_pri = priority;
    t.effective_pri = priority;
    t.entry = Some(entry);
    t.arg = arg;
    t.stack_base = base;
    t.stack_size = size;
    t.sp = sp;
    t.name = name;
}

/// Initialize a thread without starting it. Fails when the table is full,
/// the priority is out of range, or the stack is too small.
pub fn thread_create(
    name: &'static str,
    entry: ThreadEntry,
    arg: usize,
    priority: u8,
    stack: &'static mut [u8],
) -> Option<ThreadId> {
    if priority as usize >= MAX_PRIORITIES || stack.len() < MIN_STACK_SIZE {
        return None;
    }
    let mut k = KERNEL.lock();
    let ks = &mut *k;
    let tid = alloc_slot(ks)?;
    init_thread_slot(ks, tid, name, entry, arg, priority, stack);
    Some(tid)
}

/// Make an initialized thread runnable. Preempts immediately if it
/// outranks the running thread.
pub fn thread_start(tid: ThreadId) -> bool {
    let preempt;
    {
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        if tid as usize >= MAX_THREADS || ks.threads[tid as usize].state != ThreadState::Init {
            return false;
        }
        ks.threads[tid as usize].state = ThreadState::Runnable;
        run_enqueue_back(ks, tid);
        let run = ks.running;
        preempt = run != INVALID_THREAD_ID
            && ks.threads[tid as usize].effective_pri < ks.threads[run as usize].effective_pri;
    }
    if preempt && super::is_started() {
        super::yield_now();
    }
    true
}

/// `thread_create` + `thread_start`.
pub fn thread_spawn(
    name: &'static str,
    entry: ThreadEntry,
    arg: usize,
    priority: u8,
    stack: &'static mut [u8],
) -> Option<ThreadId> {
    let tid = thread_create(name, entry, arg, priority, stack)?;
    thread_start(tid);
    Some(tid)
}

pub(crate) fn create_idle(ks: &mut KernelState) -> u16 {
    static IDLE_STACK: StaticStack<IDLE_STACK_SIZE> = StaticStack::new();
    // SAFETY: kernel_init rebuilds the idle slot together with its stack;
    // no older idle thread can still be running at that point.
    let stack = unsafe { IDLE_STACK.raw() };
    let tid = alloc_slot(ks).unwrap_or(0);
    init_thread_slot(ks, tid, "idle", idle::idle_entry, 0, IDLE_PRIORITY, stack);
    ks.threads[tid as usize].state = ThreadState::Runnable;
    run_enqueue_back(ks, tid);
    tid
}

// ---------------------------------------------------------------------------
// Detach / recycle helpers (shared with the scheduler and timeouts)
// ---------------------------------------------------------------------------

/// Unhook `tid` from every kernel structure: the timer list and whichever
/// wait-link list currently holds it.
pub(crate) fn detach(ks: &mut KernelState, tid: u16) {
    if ks.threads[tid as usize].timer_link.is_linked() {
        timer_list::remove_thread(ks, tid);
    }
    if !ks.threads[tid as usize].wait_link.is_linked() {
        ks.threads[tid as usize].wait_target = WaitTarget::None;
        return;
    }
    match ks.threads[tid as usize].wait_target {
        WaitTarget::Sync(core) => {
            // SAFETY: kernel lock held; a sync object outlives its waiters.
            unsafe {
                let mut list = (*core).pend.load();
                list.remove(&mut WaitLinks(&mut ks.threads), tid);
                (*core).pend.store(list);
            }
        }
        WaitTarget::Mutex(m) => {
            // SAFETY: as above.
            unsafe {
                let mut list = (*m).pend.load();
                list.remove(&mut WaitLinks(&mut ks.threads), tid);
                (*m).pend.store(list);
            }
        }
        WaitTarget::Stop(target) => {
            let mut q = ks.threads[target as usize].stop_queue;
            q.remove(&mut WaitLinks(&mut ks.threads), tid);
            ks.threads[target as usize].stop_queue = q;
        }
        WaitTarget::None => run_remove(ks, tid),
    }
    ks.threads[tid as usize].wait_target = WaitTarget::None;
}

/// Rebuild `tid` to run its termination handler at its nominal priority
/// and make it runnable. Used by kill and by the scheduler when it meets a
/// `TimeToStop` thread.
pub(crate) fn recycle_into_term(ks: &mut KernelState, tid: u16) {
    detach(ks, tid);
    let ti = tid as usize;
    let (entry, arg) = (ks.threads[ti].term_entry, ks.threads[ti].term_arg);
    let base = ks.threads[ti].stack_base;
    let size = ks.threads[ti].stack_size;
    // SAFETY: base/size describe the stack handed over at creation; the
    // thread is off-CPU (the scheduler runs on the exception stack).
    let stack = unsafe { core::slice::from_raw_parts_mut(base, size) };
    stack.fill(STACK_FILL_BYTE);
    let (tramp, guard) = entry_fns();
    let sp = arch::init_stack(stack, tramp, guard, ti);

    let t = &mut ks.threads[ti];
    t.effective_pri = t.nominal_pri;
    t.entry = entry;
    t.arg = arg;
    t.sp = sp;
    t.timed_out = false;
    t.wait_target = WaitTarget::None;
    t.state = ThreadState::Runnable;
    run_enqueue_back(ks, tid);
}

fn wake_stop_waiters(ks: &mut KernelState, tid: u16) {
    let mut q = ks.threads[tid as usize].stop_queue;
    while let Some(w) = q.pop_front(&mut WaitLinks(&mut ks.threads)) {
        if ks.threads[w as usize].timer_link.is_linked() {
            timer_list::remove_thread(ks, w);
        }
        let t = &mut ks.threads[w as usize];
        t.state = ThreadState::Runnable;
        t.wait_target = WaitTarget::None;
        run_enqueue_back(ks, w);
    }
    ks.threads[tid as usize].stop_queue = q;
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

/// The bookkeeping half of a thread exit; shared with the trampoline.
pub(crate) fn exit_current(code: i32) {
    let mut k = KERNEL.lock();
    let ks = &mut *k;
    let tid = ks.running;
    if tid != INVALID_THREAD_ID {
        ks.threads[tid as usize].stop_value = code;
        detach(ks, tid);
        ks.threads[tid as usize].state = ThreadState::Stopped;
        wake_stop_waiters(ks, tid);
    }
}

/// Stop the running thread with `code` as its stop value, releasing every
/// thread waiting for it.
pub fn thread_exit(code: i32) -> ! {
    exit_current(code);
    loop {
        arch::pend_context_switch();
        arch::wait_for_event();
    }
}

/// Terminate a thread. Killing self marks the thread and yields; killing
/// another thread snapshots nothing — the victim is rebuilt to run its
/// termination handler at its original priority.
pub fn thread_kill(tid: ThreadId) -> bool {
    if tid as usize >= MAX_THREADS {
        return false;
    }
    if super::current_thread() == tid {
        super::terminate_running_thread();
        return true;
    }
    let mut k = KERNEL.lock();
    let ks = &mut *k;
    match ks.threads[tid as usize].state {
        ThreadState::Uninit | ThreadState::Stopped => false,
        ThreadState::Init => {
            ks.threads[tid as usize].state = ThreadState::Uninit;
            true
        }
        _ => {
            recycle_into_term(ks, tid);
            true
        }
    }
}

fn read_stop_value(ks: &KernelState, tid: u16) -> Option<i32> {
    if ks.threads[tid as usize].state == ThreadState::Stopped {
        Some(ks.threads[tid as usize].stop_value)
    } else {
        None
    }
}

pub(crate) fn wait_stop_once(target: ThreadId, timeout: Option<u32>) -> Option<i32> {
    let mut k = KERNEL.lock();
    let ks = &mut *k;
    if let Some(v) = read_stop_value(ks, target) {
        return Some(v);
    }
    let cur = ks.running;
    if cur == INVALID_THREAD_ID || cur == target {
        return Some(-1);
    }
    if ks.threads[cur as usize].state != ThreadState::Runnable {
        // Already parked (the hosted port re-enters here while blocked).
        return None;
    }
    run_remove(ks, cur);
    let t = &mut ks.threads[cur as usize];
    t.timed_out = false;
    t.wait_target = WaitTarget::Stop(target);
    t.state = match timeout {
        Some(ticks) => {
            t.wake_tick = ks.tick.wrapping_add(ticks as u64);
            ThreadState::WaitForStopOrTick
        }
        None => ThreadState::WaitForStop,
    };
    let mut q = ks.threads[target as usize].stop_queue;
    pend_insert(&mut ks.threads, &mut q, cur);
    ks.threads[target as usize].stop_queue = q;
    None
}

/// Block until `target` stops; returns its stop value.
pub fn thread_wait_for_stop(target: ThreadId) -> i32 {
    if target as usize >= MAX_THREADS {
        return -1;
    }
    loop {
        if let Some(v) = wait_stop_once(target, None) {
            return v;
        }
        super::yield_now();
    }
}

/// Block until `target` stops or `ticks` elapse. `None` on timeout.
pub fn thread_wait_for_stop_timeout(target: ThreadId, ticks: u32) -> Option<i32> {
    if target as usize >= MAX_THREADS {
        return None;
    }
    loop {
        if let Some(v) = wait_stop_once(target, Some(ticks)) {
            return Some(v);
        }
        super::yield_now();
        if super::take_timed_out() {
            // The stop may have raced the timeout; prefer the stop.
            return read_stop_value(&KERNEL.lock(), target);
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Change a thread's nominal priority. An active inheritance raise is
/// preserved; the thread's position in its run queue or pend queue is
/// re-derived from the new effective priority.
pub fn thread_set_priority(tid: ThreadId, priority: u8) -> bool {
    if tid as usize >= MAX_THREADS || priority as usize >= MAX_PRIORITIES {
        return false;
    }
    let mut k = KERNEL.lock();
    let ks = &mut *k;
    let ti = tid as usize;
    if matches!(
        ks.threads[ti].state,
        ThreadState::Uninit | ThreadState::Stopped
    ) {
        return false;
    }

    let was_raised = ks.threads[ti].effective_pri < ks.threads[ti].nominal_pri;
    ks.threads[ti].nominal_pri = priority;
    let new_eff = if was_raised {
        // Inheritance stays in force unless the new nominal outranks it.
        ks.threads[ti].effective_pri.min(priority)
    } else {
        priority
    };
    if new_eff == ks.threads[ti].effective_pri {
        return true;
    }

    match ks.threads[ti].state {
        ThreadState::Runnable => {
            run_remove(ks, tid);
            ks.threads[ti].effective_pri = new_eff;
            run_enqueue_back(ks, tid);
        }
        s if s.is_waiting() && ks.threads[ti].wait_link.is_linked() => {
            resort_pend_position(ks, tid, new_eff);
        }
        _ => ks.threads[ti].effective_pri = new_eff,
    }
    true
}

/// Re-sort a blocked thread inside the pend queue of the object it is
/// blocked on after an effective-priority change.
fn resort_pend_position(ks: &mut KernelState, tid: u16, new_eff: u8) {
    match ks.threads[tid as usize].wait_target {
        WaitTarget::Sync(core) => {
            // SAFETY: kernel lock held.
            unsafe {
                let mut list = (*core).pend.load();
                list.remove(&mut WaitLinks(&mut ks.threads), tid);
                ks.threads[tid as usize].effective_pri = new_eff;
                pend_insert(&mut ks.threads, &mut list, tid);
                (*core).pend.store(list);
            }
        }
        WaitTarget::Mutex(m) => {
            // SAFETY: kernel lock held.
            unsafe {
                let mut list = (*m).pend.load();
                list.remove(&mut WaitLinks(&mut ks.threads), tid);
                ks.threads[tid as usize].effective_pri = new_eff;
                pend_insert(&mut ks.threads, &mut list, tid);
                (*m).pend.store(list);
            }
        }
        WaitTarget::Stop(target) => {
            let mut q = ks.threads[target as usize].stop_queue;
            q.remove(&mut WaitLinks(&mut ks.threads), tid);
            ks.threads[tid as usize].effective_pri = new_eff;
            pend_insert(&mut ks.threads, &mut q, tid);
            ks.threads[target as usize].stop_queue = q;
        }
        WaitTarget::None => ks.threads[tid as usize].effective_pri = new_eff,
    }
}

pub fn thread_get_priority(tid: ThreadId) -> u8 {
    KERNEL.lock().threads[tid as usize].nominal_pri
}

pub fn thread_get_effective_priority(tid: ThreadId) -> u8 {
    KERNEL.lock().threads[tid as usize].effective_pri
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

pub fn thread_get_state(tid: ThreadId) -> ThreadState {
    if tid as usize >= MAX_THREADS {
        return ThreadState::Uninit;
    }
    KERNEL.lock().threads[tid as usize].state
}

pub fn thread_name(tid: ThreadId) -> &'static str {
    if tid as usize >= MAX_THREADS {
        return "";
    }
    KERNEL.lock().threads[tid as usize].name
}

pub fn thread_set_user_data(tid: ThreadId, data: usize) {
    if tid as usize >= MAX_THREADS {
        return;
    }
    KERNEL.lock().threads[tid as usize].user_data = data;
}

pub fn thread_user_data(tid: ThreadId) -> usize {
    if tid as usize >= MAX_THREADS {
        return 0;
    }
    KERNEL.lock().threads[tid as usize].user_data
}

/// Install the handler a thread runs when it is killed, with its argument.
pub fn thread_set_term_handler(tid: ThreadId, handler: ThreadEntry, arg: usize) {
    if tid as usize >= MAX_THREADS {
        return;
    }
    let mut k = KERNEL.lock();
    k.threads[tid as usize].term_entry = Some(handler);
    k.threads[tid as usize].term_arg = arg;
}

/// Replace an initialized-but-unstarted thread's stack, e.g. to move it
/// into a larger region before start. Rebuilds the entry frame.
pub fn thread_set_stack(tid: ThreadId, stack: &'static mut [u8]) -> bool {
    if tid as usize >= MAX_THREADS || stack.len() < MIN_STACK_SIZE {
        return false;
    }
    let mut k = KERNEL.lock();
    let ks = &mut *k;
    if ks.threads[tid as usize].state != ThreadState::Init {
        return false;
    }
    let base = stack.as_mut_ptr();
    let size = stack.len();
    stack.fill(STACK_FILL_BYTE);
    let (tramp, guard) = entry_fns();
    let sp = arch::init_stack(stack, tramp, guard, tid as usize);
    let t = &mut ks.threads[tid as usize];
    t.stack_base = base;
    t.stack_size = size;
    t.sp = sp;
    true
}

pub fn thread_stack_size(tid: ThreadId) -> usize {
    if tid as usize >= MAX_THREADS {
        return 0;
    }
    KERNEL.lock().threads[tid as usize].stack_size
}

/// Peak stack usage in bytes, measured from the fill pattern.
pub fn thread_stack_usage(tid: ThreadId) -> usize {
    if tid as usize >= MAX_THREADS {
        return 0;
    }
    let k = KERNEL.lock();
    let t = &k.threads[tid as usize];
    if t.stack_base.is_null() {
        return 0;
    }
    // SAFETY: base/size describe the stack handed over at creation.
    let s = unsafe { core::slice::from_raw_parts(t.stack_base, t.stack_size) };
    let untouched = s.iter().take_while(|&&b| b == STACK_FILL_BYTE).count();
    t.stack_size - untouched
}
