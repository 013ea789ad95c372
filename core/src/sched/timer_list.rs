//! The merged timer list: one sorted-by-wake-tick list holding both
//! thread timeouts and software timers.
//!
//! Nodes are `u16` indices with an explicit tag ([`TimerNode`]): values
//! below `MAX_THREADS` are threads (link storage: `Thread::timer_link`),
//! values at or above are timer-arena slots (link storage:
//! [`TimerSlot::link`]). Insertion is a linear sort — the target class of
//! system runs a handful of concurrent timers — and the head is always the
//! earliest wake, which is what the tick handler scans and the tickless
//! idle path consults.
//!
//! Timer callbacks run from tick context but *outside* the kernel lock, so
//! they may use every ISR-safe operation (including re-arming their own
//! timer). A callback returning `true` means "one-shot, done"; returning
//! `false` re-arms the timer one period further along unless the callback
//! already moved it.

use ternos_abi::{MAX_THREADS, MAX_TIMERS, ThreadState};
use ternos_lib::list::{Link, LinkArena};

use super::thread::{Thread, WaitTarget};
use super::{KERNEL, KernelState, WaitLinks, run_enqueue_back};
use crate::sync::timer::TimerCallback;

pub(crate) const TIMER_NODE_BASE: u16 = MAX_THREADS as u16;

/// Tagged view of a merged-list node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerNode {
    Thread(u16),
    Timer(u16),
}

#[inline]
fn encode(node: TimerNode) -> u16 {
    match node {
        TimerNode::Thread(t) => t,
        TimerNode::Timer(i) => TIMER_NODE_BASE + i,
    }
}

#[inline]
fn decode(raw: u16) -> TimerNode {
    if raw < TIMER_NODE_BASE {
        TimerNode::Thread(raw)
    } else {
        TimerNode::Timer(raw - TIMER_NODE_BASE)
    }
}

// ---------------------------------------------------------------------------
// Timer arena slots
// ---------------------------------------------------------------------------

pub(crate) struct TimerSlot {
    pub link: Link,
    pub callback: Option<TimerCallback>,
    pub user: usize,
    pub wake_tick: u64,
    pub duration: u32,
    /// Bumped by every set/cancel/reset so an in-flight expiry can tell
    /// the slot was retargeted under it.
    pub generation: u32,
    pub active: bool,
    pub allocated: bool,
}

impl TimerSlot {
    pub(crate) const fn empty() -> Self {
        Self {
            link: Link::detached(),
            callback: None,
            user: 0,
            wake_tick: 0,
            duration: 0,
            generation: 0,
            active: false,
            allocated: false,
        }
    }
}

/// `LinkArena` over both node kinds of the merged list.
struct TimerLinks<'a> {
    threads: &'a mut [Thread; MAX_THREADS],
    timers: &'a mut [TimerSlot; MAX_TIMERS],
}

impl LinkArena for TimerLinks<'_> {
    fn link(&self, idx: u16) -> Link {
        match decode(idx) {
            TimerNode::Thread(t) => self.threads[t as usize].timer_link,
            TimerNode::Timer(i) => self.timers[i as usize].link,
        }
    }
    fn set_link(&mut self, idx: u16, link: Link) {
        match decode(idx) {
            TimerNode::Thread(t) => self.threads[t as usize].timer_link = link,
            TimerNode::Timer(i) => self.timers[i as usize].link = link,
        }
    }
}

fn wake_of(ks: &KernelState, raw: u16) -> u64 {
    match decode(raw) {
        TimerNode::Thread(t) => ks.threads[t as usize].wake_tick,
        TimerNode::Timer(i) => ks.timers[i as usize].wake_tick,
    }
}

// ---------------------------------------------------------------------------
// List operations
// ---------------------------------------------------------------------------

fn insert(ks: &mut KernelState, node: TimerNode) {
    let raw = encode(node);
    let wake = wake_of(ks, raw);

    let KernelState {
        threads,
        timers,
        timer_list,
        ..
    } = ks;
    let mut arena = TimerLinks { threads, timers };

    let mut at = None;
    for n in timer_list.iter(&arena) {
        let w = match decode(n) {
            TimerNode::Thread(t) => arena.threads[t as usize].wake_tick,
            TimerNode::Timer(i) => arena.timers[i as usize].wake_tick,
        };
        if w > wake {
            at = Some(n);
            break;
        }
    }
    match at {
        Some(n) => timer_list.insert_before(&mut arena, n, raw),
        None => timer_list.push_back(&mut arena, raw),
    }
}

fn remove(ks: &mut KernelState, node: TimerNode) {
    let raw = encode(node);
    let KernelState {
        threads,
        timers,
        timer_list,
        ..
    } = ks;
    let mut arena = TimerLinks { threads, timers };
    if arena.link(raw).is_linked() {
        timer_list.remove(&mut arena, raw);
    }
}

pub(crate) fn insert_thread(ks: &mut KernelState, tid: u16) {
    insert(ks, TimerNode::Thread(tid));
}

pub(crate) fn remove_thread(ks: &mut KernelState, tid: u16) {
    remove(ks, TimerNode::Thread(tid));
}

pub(crate) fn insert_timer(ks: &mut KernelState, slot: u16) {
    insert(ks, TimerNode::Timer(slot));
}

pub(crate) fn remove_timer(ks: &mut KernelState, slot: u16) {
    remove(ks, TimerNode::Timer(slot));
}

/// Wake tick of the earliest entry; what tickless idle sleeps towards.
pub(crate) fn earliest_wake(ks: &KernelState) -> Option<u64> {
    ks.timer_list.head().map(|n| wake_of(ks, n))
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

/// Timers that expired during an advance; their callbacks are dispatched
/// after the kernel lock is released.
pub(crate) struct Fired {
    entries: [(u16, TimerCallback, usize, u32); MAX_TIMERS],
    len: usize,
}

impl Fired {
    fn new() -> Self {
        Self {
            entries: [(0, unreachable_callback, 0, 0); MAX_TIMERS],
            len: 0,
        }
    }
}

fn unreachable_callback(_: usize) -> bool {
    true
}

/// Pop every expired entry off the sorted list. Thread timeouts are
/// resolved inline; timers are collected for [`dispatch`].
pub(crate) fn advance(ks: &mut KernelState) -> Fired {
    let now = ks.tick;
    let mut fired = Fired::new();

    loop {
        let Some(head) = ks.timer_list.head() else {
            break;
        };
        if wake_of(ks, head) > now {
            // Sorted list: nothing further along can be due.
            break;
        }
        let node = decode(head);
        remove(ks, node);
        match node {
            TimerNode::Thread(t) => expire_thread_timeout(ks, t),
            TimerNode::Timer(i) => {
                let s = &ks.timers[i as usize];
                if s.active {
                    if let Some(cb) = s.callback {
                        fired.entries[fired.len] = (i, cb, s.user, s.generation);
                        fired.len += 1;
                    }
                }
            }
        }
    }
    fired
}

/// Run collected callbacks and apply the one-shot/periodic protocol.
/// Called without the kernel lock.
pub(crate) fn dispatch(fired: &Fired) {
    for &(slot, callback, user, generation) in &fired.entries[..fired.len] {
        let one_shot = callback(user);
        let mut k = KERNEL.lock();
        let ks = &mut *k;
        let s = &mut ks.timers[slot as usize];
        if s.generation != generation {
            // The callback (or another thread) retargeted the timer;
            // whatever they armed stands.
            continue;
        }
        if one_shot {
            s.active = false;
        } else if !s.link.is_linked() {
            // Periodic: advance by one period from the scheduled wake so
            // the cadence does not drift with dispatch latency.
            s.wake_tick = s.wake_tick.wrapping_add(s.duration as u64);
            insert_timer(ks, slot);
        }
    }
}

/// A blocked thread's timeout came due. The event-queue check resolves the
/// release-vs-timeout race in favour of the release: if the awaited object
/// already queued an event that will wake this thread, the timeout is
/// swallowed and the drain does the wakeup.
fn expire_thread_timeout(ks: &mut KernelState, tid: u16) {
    match ks.threads[tid as usize].wait_target {
        WaitTarget::Sync(core) => {
            // SAFETY: kernel lock held; the object outlives its waiters.
            unsafe {
                let queued = (*core)
                    .on_event_queue
                    .load(core::sync::atomic::Ordering::Acquire);
                let mut pend = (*core).pend.load();
                if queued && pend.head() == Some(tid) {
                    // The event beat the timeout; leave the thread where
                    // the drain will find it.
                    return;
                }
                pend.remove(&mut WaitLinks(&mut ks.threads), tid);
                (*core).pend.store(pend);
            }
            ks.threads[tid as usize].timed_out = true;
        }
        WaitTarget::Stop(target) => {
            let mut q = ks.threads[target as usize].stop_queue;
            q.remove(&mut WaitLinks(&mut ks.threads), tid);
            ks.threads[target as usize].stop_queue = q;
            ks.threads[tid as usize].timed_out = true;
        }
        // Plain delays just wake; mutex waits never carry a timeout.
        WaitTarget::None | WaitTarget::Mutex(_) => {}
    }
    let t = &mut ks.threads[tid as usize];
    t.state = ThreadState::Runnable;
    t.wait_target = WaitTarget::None;
    run_enqueue_back(ks, tid);
}
