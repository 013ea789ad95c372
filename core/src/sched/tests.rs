//! Host-side scheduler tests.
//!
//! The hosted port performs no real context switches, so these tests stand
//! in for the switch exception: they call [`scheduler_entry`] directly,
//! advance ticks by hand, and act "as" individual threads by retargeting
//! the running-thread pointer. Every queue, state transition, and decision
//! path is the real kernel code.

use ternos_abi::ThreadState;

use super::testutil::*;
use super::thread::{self};
use super::*;

#[test]
fn idle_runs_when_nothing_else_is_runnable() {
    let _g = kernel_fixture();
    let idle = KERNEL.lock().idle;
    scheduler::scheduler_entry(0x100);
    assert_eq!(current_thread(), idle);
    assert_eq!(thread_get_state(idle), ThreadState::Runnable);
}

#[test]
fn highest_priority_runnable_thread_wins() {
    let _g = kernel_fixture();
    let a = spawn("a", 1);
    let b = spawn("b", 2);
    let c = spawn("c", 3);

    scheduler::scheduler_entry(0x200);
    assert_eq!(current_thread(), a);

    // a sleeps; b takes over.
    delay(5);
    scheduler::scheduler_entry(0x201);
    assert_eq!(current_thread(), b);
    assert_eq!(thread_get_state(a), ThreadState::WaitForTick);

    delay(5);
    scheduler::scheduler_entry(0x202);
    assert_eq!(current_thread(), c);

    delay(5);
    scheduler::scheduler_entry(0x203);
    assert_eq!(current_thread(), KERNEL.lock().idle);

    // Every sleeper wakes; priority 1 runs first again.
    advance_tick_count(5);
    scheduler::scheduler_entry(0x204);
    assert_eq!(current_thread(), a);
    assert_eq!(thread_get_state(b), ThreadState::Runnable);
    assert_eq!(thread_get_state(c), ThreadState::Runnable);
}

#[test]
fn same_priority_round_robins() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    let b = spawn("b", 2);

    scheduler::scheduler_entry(0x300);
    let first = current_thread();
    scheduler::scheduler_entry(0x301);
    let second = current_thread();
    scheduler::scheduler_entry(0x302);
    let third = current_thread();

    assert_eq!(first, a);
    assert_eq!(second, b);
    assert_eq!(third, a);
}

#[test]
fn delay_files_into_timer_list_and_wakes() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    scheduler::scheduler_entry(0x400);
    assert_eq!(current_thread(), a);

    delay(3);
    scheduler::scheduler_entry(0x401);
    // Not yet due.
    advance_tick_count(2);
    assert_eq!(thread_get_state(a), ThreadState::WaitForTick);
    advance_tick_count(1);
    assert_eq!(thread_get_state(a), ThreadState::Runnable);
    assert!(!timed_out(a));
    scheduler::scheduler_entry(0x402);
    assert_eq!(current_thread(), a);
}

#[test]
fn exit_releases_stop_waiters() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    let w = spawn("w", 3);

    set_running(w);
    assert_eq!(thread::wait_stop_once(a, None), None);
    assert_eq!(thread_state(w), ThreadState::WaitForStop);

    set_running(a);
    thread::exit_current(7);
    assert_eq!(thread_state(a), ThreadState::Stopped);
    assert_eq!(thread_state(w), ThreadState::Runnable);

    // The joiner reads the stop value without blocking now.
    set_running(w);
    assert_eq!(thread_wait_for_stop(a), 7);
}

#[test]
fn stop_wait_timeout_expires() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    let w = spawn("w", 3);

    set_running(w);
    assert_eq!(thread::wait_stop_once(a, Some(4)), None);
    assert_eq!(thread_state(w), ThreadState::WaitForStopOrTick);

    // The scheduler files the timeout when the switch is taken.
    scheduler::scheduler_entry(0x500);
    advance_tick_count(4);
    assert_eq!(thread_state(w), ThreadState::Runnable);
    assert!(timed_out(w));
}

#[test]
#[allow(unpredictable_function_pointer_comparisons)]
fn kill_other_recycles_into_termination_handler() {
    let _g = kernel_fixture();

    fn term(_arg: usize) -> i32 {
        0
    }

    let a = spawn("a", 2);
    thread_set_term_handler(a, term, 9);
    assert!(thread_kill(a));
    {
        let k = KERNEL.lock();
        let t = &k.threads[a as usize];
        assert_eq!(t.state, ThreadState::Runnable);
        assert_eq!(t.entry, Some(term as ternos_abi::ThreadEntry));
        assert_eq!(t.arg, 9);
        assert_eq!(t.effective_pri, 2);
    }
    // Already-stopped threads cannot be killed again.
    set_running(a);
    thread::exit_current(0);
    assert!(!thread_kill(a));
}

#[test]
fn kill_self_goes_through_time_to_stop() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    scheduler::scheduler_entry(0x600);
    assert_eq!(current_thread(), a);

    assert!(thread_kill(a));
    assert_eq!(thread_state(a), ThreadState::TimeToStop);

    // The next scheduling pass recycles it into its termination path.
    scheduler::scheduler_entry(0x601);
    assert_eq!(thread_state(a), ThreadState::Runnable);
}

#[test]
fn priority_change_requeues_runnable_thread() {
    let _g = kernel_fixture();
    let a = spawn("a", 3);
    let b = spawn("b", 2);

    scheduler::scheduler_entry(0x700);
    assert_eq!(current_thread(), b);

    assert!(thread_set_priority(a, 1));
    assert_eq!(thread_get_priority(a), 1);
    assert_eq!(thread_get_effective_priority(a), 1);
    scheduler::scheduler_entry(0x701);
    assert_eq!(current_thread(), a);
}

#[test]
fn create_validates_arguments() {
    let _g = kernel_fixture();
    assert!(thread_create("bad-pri", noop_entry, 0, ternos_abi::MAX_PRIORITIES as u8, leak_stack(512)).is_none());
    assert!(thread_create("tiny-stack", noop_entry, 0, 1, leak_stack(64)).is_none());
    let ok = thread_create("ok", noop_entry, 0, 1, leak_stack(512));
    assert!(ok.is_some());
    assert_eq!(thread_get_state(ok.unwrap()), ThreadState::Init);
}

#[test]
fn table_exhaustion_returns_none() {
    let _g = kernel_fixture();
    let mut created = 0;
    while thread_create("filler", noop_entry, 0, 4, leak_stack(512)).is_some() {
        created += 1;
    }
    // All slots minus the idle thread.
    assert_eq!(created, ternos_abi::MAX_THREADS - 1);
}

#[test]
fn stack_can_be_replaced_before_start() {
    let _g = kernel_fixture();
    let a = thread_create("a", noop_entry, 0, 2, leak_stack(512)).unwrap();
    assert_eq!(thread_stack_size(a), 512);
    assert!(thread_set_stack(a, leak_stack(2048)));
    assert_eq!(thread_stack_size(a), 2048);
    assert!(thread_start(a));
    // Started threads keep their stack.
    assert!(!thread_set_stack(a, leak_stack(1024)));
}

#[test]
fn stack_usage_tracks_scribbles() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    assert_eq!(thread_stack_usage(a), 0);
    {
        let k = KERNEL.lock();
        let t = &k.threads[a as usize];
        // Pretend the thread pushed 32 bytes.
        unsafe {
            core::ptr::write_bytes(t.stack_base.add(t.stack_size - 32), 0, 32);
        }
    }
    assert_eq!(thread_stack_usage(a), 32);
}

#[test]
fn errno_is_per_thread() {
    let _g = kernel_fixture();
    let a = spawn("a", 2);
    let b = spawn("b", 3);

    scheduler::scheduler_entry(0x800);
    assert_eq!(current_thread(), a);
    set_errno(17);

    delay(1);
    scheduler::scheduler_entry(0x801);
    assert_eq!(current_thread(), b);
    assert_eq!(errno(), 0);
    set_errno(23);

    advance_tick_count(1);
    // b keeps running (higher-priority a is woken but switch picks a).
    scheduler::scheduler_entry(0x802);
    assert_eq!(current_thread(), a);
    assert_eq!(errno(), 17);
}

#[test]
fn kernel_stats_count_switches_and_threads() {
    let _g = kernel_fixture();
    spawn("a", 2);
    let before = kernel_stats();
    scheduler::scheduler_entry(0x900);
    let after = kernel_stats();
    assert_eq!(after.context_switches, before.context_switches + 1);
    assert_eq!(after.threads_live, 2); // idle + a
}
