//! Hosted port: no real context switching, no real tick hardware.
//!
//! Exists so the portable kernel code compiles and runs under host unit
//! tests. Context-switch requests are counted instead of taken; tests drive
//! the scheduler by calling [`crate::sched::scheduler_entry`] directly.
//! Stack "frames" are cookies (the stack top address), which is all the
//! scheduler ever compares.

use core::sync::atomic::{AtomicU32, Ordering};

static SWITCH_REQUESTS: AtomicU32 = AtomicU32::new(0);

pub fn port_init() {}

/// Record a context-switch request. The real port pends the switch
/// exception here.
#[inline]
pub fn pend_context_switch() {
    SWITCH_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

/// Number of context-switch requests since the last clear (test hook).
pub fn switch_requests() -> u32 {
    SWITCH_REQUESTS.load(Ordering::Relaxed)
}

pub fn clear_switch_requests() {
    SWITCH_REQUESTS.store(0, Ordering::Relaxed);
}

/// Hosted stacks are opaque: the returned "stack pointer" is just the stack
/// top, which the scheduler stores and hands back verbatim.
pub fn init_stack(stack: &mut [u8], _trampoline: usize, _guard: usize, _arg: usize) -> usize {
    stack.as_ptr() as usize + stack.len()
}

pub fn start_first_thread(_sp: usize) -> ! {
    panic!("hosted port cannot enter thread mode");
}

pub fn tick_stop() {}

pub fn tick_rearm_periodic() {}

/// The hosted down-counter is unconstrained; pick a small bound so the
/// idle-path math stays observable in tests.
pub fn max_sleep_ticks() -> u32 {
    64
}

pub fn tickless_begin(_span_ticks: u32) {}

/// Hosted sleeps always "roll over": the full span elapses.
pub fn tickless_end(span_ticks: u32) -> u32 {
    span_ticks
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn wait_for_event() {
    core::hint::spin_loop();
}
