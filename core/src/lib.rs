//! Ternos kernel core: scheduler, threads, synchronization primitives,
//! software timers, blocking queues, and the client-context runtime.
//!
//! The kernel is single-core and preemptive with fixed priorities and
//! round-robin rotation within a priority. All scheduling decisions happen
//! inside the pendable context-switch exception; ISR-originated releases are
//! deferred through a scheduler-owned event queue so interrupt paths stay
//! short and the runnable set is only ever mutated by the scheduler.
//!
//! The Cortex-M port lives in [`arch`]; every other module is portable and
//! exercised by host unit tests against the hosted port.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod context;
pub mod fault;
pub mod hooks;
pub mod sched;
pub mod sync;

pub use context::{ClientHandler, ClientId, Context, ContextMessage, ContextTimer, MessageKind};
pub use fault::{FaultPolicy, FaultRegs, FaultStatus, fault_policy, set_fault_policy};
pub use sched::{
    KernelStats, StaticStack, advance_tick_count, clock_cycles_per_tick, current_thread,
    cycle_count, delay, delay_microseconds, errno, is_started, kernel_init, kernel_set_clock,
    kernel_start, kernel_stats, kernel_tick, scheduler_entry, set_errno, thread_create,
    thread_exit, thread_get_effective_priority, thread_get_priority, thread_get_state,
    thread_kill, thread_name, thread_set_priority, thread_set_stack, thread_set_term_handler,
    thread_set_user_data, thread_spawn, thread_stack_size, thread_stack_usage, thread_start,
    thread_user_data, thread_wait_for_stop, thread_wait_for_stop_timeout, tick_count, yield_now,
};
pub use sync::{
    Mutex, Queue, QueueGroup, QueueU32, Semaphore, Signal, Timer, TimerCallback, clear_channel,
    next_channel,
};
