//! Optional single-instance kernel hooks.
//!
//! Each hook is registered at most once, before the scheduler starts:
//!
//! - the **event hook** fires on scheduler entry, scheduler exit, and tick —
//!   intended for profiling and tracing;
//! - the **sleep/wake hooks** bracket the idle thread's wait-for-interrupt,
//!   for boards that gate clocks or rails around sleep;
//! - the **crash hook** is the low-level "induce crash" primitive invoked by
//!   failed kernel assertions (typically a breakpoint or a watchdog poke).

use spin::Once;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelEvent {
    SchedulerEntry,
    SchedulerExit,
    Tick,
}

pub type EventHook = fn(KernelEvent);
pub type PowerHook = fn();
pub type CrashHook = fn();

static EVENT_HOOK: Once<EventHook> = Once::new();
static SLEEP_HOOK: Once<PowerHook> = Once::new();
static WAKE_HOOK: Once<PowerHook> = Once::new();
static CRASH_HOOK: Once<CrashHook> = Once::new();

pub fn register_event_hook(hook: EventHook) {
    EVENT_HOOK.call_once(|| hook);
}

pub fn register_sleep_hook(hook: PowerHook) {
    SLEEP_HOOK.call_once(|| hook);
}

pub fn register_wake_hook(hook: PowerHook) {
    WAKE_HOOK.call_once(|| hook);
}

pub fn register_crash_hook(hook: CrashHook) {
    CRASH_HOOK.call_once(|| hook);
}

#[inline]
pub(crate) fn event(e: KernelEvent) {
    if let Some(hook) = EVENT_HOOK.get() {
        hook(e);
    }
}

#[inline]
pub(crate) fn sleep() {
    if let Some(hook) = SLEEP_HOOK.get() {
        hook();
    }
}

#[inline]
pub(crate) fn wake() {
    if let Some(hook) = WAKE_HOOK.get() {
        hook();
    }
}

#[inline]
pub(crate) fn crash() {
    if let Some(hook) = CRASH_HOOK.get() {
        hook();
    }
}
